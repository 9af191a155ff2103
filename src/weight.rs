//! Symbolic weight-expression DAG.
//!
//! Mirrors the source's global `ExprStructFactory`, but as an explicit,
//! thread-confined arena of interned node indices rather than a process-wide
//! pool of raw pointers (see `SPEC_FULL.md` §9 and the crate-level design
//! note on replacing global singletons with an explicit context). Nodes are
//! never freed for the arena's lifetime; cross-arena sharing is not
//! supported and is not needed since the recommended usage is one arena per
//! thread.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::params::ParamDefs;

/// An interned handle into a [`WeightArena`]. Cheap to copy; meaningless
/// outside the arena that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(u32);

#[derive(Debug, Clone, PartialEq)]
enum ExprNode {
    Int(i32),
    Double(f64),
    Param(String),
    Log(ExprId),
    Exp(ExprId),
    Pow(ExprId, ExprId),
    Add(ExprId, ExprId),
    Sub(ExprId, ExprId),
    Mul(ExprId, ExprId),
    Div(ExprId, ExprId),
}

/// Failure modes of [`WeightArena::eval`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// A `Param(name)` was reached with no binding in the environment (and
    /// not already being expanded from an enclosing definition).
    #[error("parameter `{0}` is not defined")]
    Undefined(String),
    /// A chain of parameter definitions refers back to itself.
    #[error("cyclic parameter definition through `{0}`")]
    Cycle(String),
}

impl From<EvalError> for crate::error::Error {
    fn from(e: EvalError) -> Self {
        match e {
            EvalError::Undefined(n) => {
                crate::error::Error::Reference(format!("parameter `{n}` is not defined"))
            }
            EvalError::Cycle(n) => {
                crate::error::Error::Cycle(format!("cyclic parameter definition through `{n}`"))
            }
        }
    }
}

/// Hash-consed factory and algebra for [`ExprId`] nodes.
///
/// `ZERO` and `ONE` are singleton constants (index 0 and 1); every smart
/// constructor funnels numerically-equal results back to them.
#[derive(Debug, Clone)]
pub struct WeightArena {
    nodes: Vec<ExprNode>,
    int_cache: HashMap<i32, ExprId>,
    double_cache: HashMap<u64, ExprId>,
    param_cache: HashMap<String, ExprId>,
    zero: ExprId,
    one: ExprId,
}

impl Default for WeightArena {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightArena {
    /// A fresh arena pre-populated with the `ZERO`/`ONE` singletons.
    pub fn new() -> Self {
        let nodes = vec![ExprNode::Int(0), ExprNode::Int(1)];
        let zero = ExprId(0);
        let one = ExprId(1);
        let mut int_cache = HashMap::new();
        int_cache.insert(0, zero);
        int_cache.insert(1, one);
        WeightArena {
            nodes,
            int_cache,
            double_cache: HashMap::new(),
            param_cache: HashMap::new(),
            zero,
            one,
        }
    }

    /// The singleton `0` constant.
    pub fn zero(&self) -> ExprId {
        self.zero
    }

    /// The singleton `1` constant.
    pub fn one(&self) -> ExprId {
        self.one
    }

    fn alloc(&mut self, node: ExprNode) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn node(&self, id: ExprId) -> &ExprNode {
        &self.nodes[id.0 as usize]
    }

    // ---- constructors --------------------------------------------------

    /// Integer constant, folded to `ZERO`/`ONE` when applicable.
    pub fn int_const(&mut self, value: i32) -> ExprId {
        if value == 0 {
            return self.zero;
        }
        if value == 1 {
            return self.one;
        }
        if let Some(&id) = self.int_cache.get(&value) {
            return id;
        }
        let id = self.alloc(ExprNode::Int(value));
        self.int_cache.insert(value, id);
        id
    }

    /// Floating-point constant, folded to `ZERO`/`ONE` when applicable.
    pub fn double_const(&mut self, value: f64) -> ExprId {
        if value == 0.0 {
            return self.zero;
        }
        if value == 1.0 {
            return self.one;
        }
        let bits = value.to_bits();
        if let Some(&id) = self.double_cache.get(&bits) {
            return id;
        }
        let id = self.alloc(ExprNode::Double(value));
        self.double_cache.insert(bits, id);
        id
    }

    /// A named free parameter reference.
    pub fn param(&mut self, name: impl Into<String>) -> ExprId {
        let name = name.into();
        if let Some(&id) = self.param_cache.get(&name) {
            return id;
        }
        let id = self.alloc(ExprNode::Param(name.clone()));
        self.param_cache.insert(name, id);
        id
    }

    /// `l + r`, constant-folded.
    pub fn add(&mut self, l: ExprId, r: ExprId) -> ExprId {
        if self.is_zero(l) {
            return r;
        }
        if self.is_zero(r) {
            return l;
        }
        if let (ExprNode::Int(a), ExprNode::Int(b)) = (self.node(l).clone(), self.node(r).clone()) {
            return self.int_const(a + b);
        }
        if self.is_number(l) && self.is_number(r) {
            return self.double_const(self.as_double(l) + self.as_double(r));
        }
        self.alloc(ExprNode::Add(l, r))
    }

    /// `l - r`; only folds the `r == 0` identity (matches the source's
    /// asymmetric `subtract`, which does not constant-fold numeric operands
    /// the way `add`/`multiply` do).
    pub fn sub(&mut self, l: ExprId, r: ExprId) -> ExprId {
        if self.is_zero(r) {
            return l;
        }
        self.alloc(ExprNode::Sub(l, r))
    }

    /// `l * r`, constant-folded.
    pub fn mul(&mut self, l: ExprId, r: ExprId) -> ExprId {
        if self.is_one(l) {
            return r;
        }
        if self.is_one(r) {
            return l;
        }
        if self.is_zero(l) || self.is_zero(r) {
            return self.zero;
        }
        if let (ExprNode::Int(a), ExprNode::Int(b)) = (self.node(l).clone(), self.node(r).clone()) {
            return self.int_const(a * b);
        }
        if self.is_number(l) && self.is_number(r) {
            return self.double_const(self.as_double(l) * self.as_double(r));
        }
        self.alloc(ExprNode::Mul(l, r))
    }

    /// `l / r`; folds to a double only when at least one operand is already
    /// a double (pure integer division is not numerically exact, so it is
    /// left symbolic, matching the source).
    pub fn div(&mut self, l: ExprId, r: ExprId) -> ExprId {
        if self.is_one(r) {
            return l;
        }
        if self.is_zero(l) {
            return self.zero;
        }
        if self.is_number(l)
            && self.is_number(r)
            && (matches!(self.node(l), ExprNode::Double(_)) || matches!(self.node(r), ExprNode::Double(_)))
        {
            return self.double_const(self.as_double(l) / self.as_double(r));
        }
        self.alloc(ExprNode::Div(l, r))
    }

    /// `a ^ b`, folding `pow(x,1)=x` and `pow(x,0)=1`.
    pub fn pow(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if self.is_one(b) {
            return a;
        }
        if self.is_zero(b) {
            return self.one;
        }
        self.alloc(ExprNode::Pow(a, b))
    }

    /// `log(p)`, folding `log(1)=0` and `log(exp(x))=x`.
    pub fn log_of(&mut self, p: ExprId) -> ExprId {
        if self.is_one(p) {
            return self.zero;
        }
        if let ExprNode::Exp(arg) = self.node(p) {
            return *arg;
        }
        self.alloc(ExprNode::Log(p))
    }

    /// `exp(p)`, folding `exp(0)=1` and `exp(log(x))=x`.
    pub fn exp_of(&mut self, p: ExprId) -> ExprId {
        if self.is_zero(p) {
            return self.one;
        }
        if let ExprNode::Log(arg) = self.node(p) {
            return *arg;
        }
        self.alloc(ExprNode::Exp(p))
    }

    /// `0 - x`.
    pub fn minus(&mut self, x: ExprId) -> ExprId {
        let z = self.zero;
        self.sub(z, x)
    }

    /// `1 - p`.
    pub fn negate(&mut self, p: ExprId) -> ExprId {
        let o = self.one;
        self.sub(o, p)
    }

    /// `1 / p`.
    pub fn reciprocal(&mut self, p: ExprId) -> ExprId {
        let o = self.one;
        self.div(o, p)
    }

    /// `1 / (1 - p)`.
    pub fn geometric_sum(&mut self, p: ExprId) -> ExprId {
        let np = self.negate(p);
        self.reciprocal(np)
    }

    // ---- predicates ------------------------------------------------------

    /// Whether `id` denotes the numeric constant zero.
    pub fn is_zero(&self, id: ExprId) -> bool {
        if id == self.zero {
            return true;
        }
        match self.node(id) {
            ExprNode::Int(i) => *i == 0,
            ExprNode::Double(d) => *d == 0.0,
            _ => false,
        }
    }

    /// Whether `id` denotes the numeric constant one.
    pub fn is_one(&self, id: ExprId) -> bool {
        if id == self.one {
            return true;
        }
        match self.node(id) {
            ExprNode::Int(i) => *i == 1,
            ExprNode::Double(d) => *d == 1.0,
            _ => false,
        }
    }

    /// Whether `id` is an `Int` or `Double` leaf.
    pub fn is_number(&self, id: ExprId) -> bool {
        matches!(self.node(id), ExprNode::Int(_) | ExprNode::Double(_))
    }

    /// The numeric value of a constant leaf. Only legal when [`is_number`]
    /// holds; callers are expected to check first (this is an internal
    /// invariant of a closed algebra, not a user input boundary).
    ///
    /// [`is_number`]: WeightArena::is_number
    pub fn as_double(&self, id: ExprId) -> f64 {
        match self.node(id) {
            ExprNode::Int(i) => *i as f64,
            ExprNode::Double(d) => *d,
            _ => panic!("as_double called on a non-numeric WeightExpr"),
        }
    }

    // ---- evaluation --------------------------------------------------------

    /// Evaluates `id` to a scalar, resolving `Param` references against
    /// `env`. Fails with [`EvalError::Undefined`] for an unbound parameter
    /// and [`EvalError::Cycle`] when a definition chain refers back to
    /// itself.
    pub fn eval(&self, id: ExprId, env: &ParamDefs) -> Result<f64, EvalError> {
        let mut resolving = HashSet::new();
        self.eval_inner(id, env, &mut resolving)
    }

    fn eval_inner(
        &self,
        id: ExprId,
        env: &ParamDefs,
        resolving: &mut HashSet<String>,
    ) -> Result<f64, EvalError> {
        match self.node(id) {
            ExprNode::Int(i) => Ok(*i as f64),
            ExprNode::Double(d) => Ok(*d),
            ExprNode::Param(name) => {
                let name = name.clone();
                if resolving.contains(&name) {
                    return Err(EvalError::Cycle(name));
                }
                let def = env.get(&name).ok_or_else(|| EvalError::Undefined(name.clone()))?;
                resolving.insert(name.clone());
                let result = self.eval_inner(def, env, resolving);
                resolving.remove(&name);
                result
            }
            ExprNode::Log(a) => Ok(self.eval_inner(*a, env, resolving)?.ln()),
            ExprNode::Exp(a) => Ok(self.eval_inner(*a, env, resolving)?.exp()),
            ExprNode::Add(l, r) => {
                Ok(self.eval_inner(*l, env, resolving)? + self.eval_inner(*r, env, resolving)?)
            }
            ExprNode::Sub(l, r) => {
                Ok(self.eval_inner(*l, env, resolving)? - self.eval_inner(*r, env, resolving)?)
            }
            ExprNode::Mul(l, r) => {
                Ok(self.eval_inner(*l, env, resolving)? * self.eval_inner(*r, env, resolving)?)
            }
            ExprNode::Div(l, r) => {
                Ok(self.eval_inner(*l, env, resolving)? / self.eval_inner(*r, env, resolving)?)
            }
            ExprNode::Pow(a, b) => {
                Ok(self.eval_inner(*a, env, resolving)?.powf(self.eval_inner(*b, env, resolving)?))
            }
        }
    }

    /// Structural substitution: replaces every bound `Param` with its
    /// definition (recursively), re-running smart constructors so the
    /// result stays folded. Unbound parameters are left as `Param`.
    pub fn bind(&mut self, id: ExprId, env: &ParamDefs) -> ExprId {
        match self.node(id).clone() {
            ExprNode::Int(_) | ExprNode::Double(_) => id,
            ExprNode::Param(name) => match env.get(&name) {
                Some(def) => self.bind(def, env),
                None => id,
            },
            ExprNode::Log(a) => {
                let a = self.bind(a, env);
                self.log_of(a)
            }
            ExprNode::Exp(a) => {
                let a = self.bind(a, env);
                self.exp_of(a)
            }
            ExprNode::Add(l, r) => {
                let (l, r) = (self.bind(l, env), self.bind(r, env));
                self.add(l, r)
            }
            ExprNode::Sub(l, r) => {
                let (l, r) = (self.bind(l, env), self.bind(r, env));
                self.sub(l, r)
            }
            ExprNode::Mul(l, r) => {
                let (l, r) = (self.bind(l, env), self.bind(r, env));
                self.mul(l, r)
            }
            ExprNode::Div(l, r) => {
                let (l, r) = (self.bind(l, env), self.bind(r, env));
                self.div(l, r)
            }
            ExprNode::Pow(a, b) => {
                let (a, b) = (self.bind(a, env), self.bind(b, env));
                self.pow(a, b)
            }
        }
    }

    /// Symbolic derivative of `id` with respect to `name`, expanding
    /// definitions from `env` (the definition for `name` itself, if any, is
    /// excluded at each level so partials are taken with respect to the
    /// free variable, not its own unfolding).
    pub fn deriv(&mut self, id: ExprId, env: &ParamDefs, name: &str) -> ExprId {
        match self.node(id).clone() {
            ExprNode::Int(_) | ExprNode::Double(_) => self.zero,
            ExprNode::Param(n) => {
                if n == name {
                    self.one
                } else if let Some(def) = env.get(&n) {
                    let inner = env.exclude(&n);
                    self.deriv(def, &inner, name)
                } else {
                    self.zero
                }
            }
            // w = exp(x), w' = x' * exp(x)
            ExprNode::Exp(a) => {
                let da = self.deriv(a, env, name);
                self.mul(da, id)
            }
            // w = log(x), w' = x' / x
            ExprNode::Log(a) => {
                let da = self.deriv(a, env, name);
                self.div(da, a)
            }
            // w = f + g, w' = f' + g'
            ExprNode::Add(l, r) => {
                let (dl, dr) = (self.deriv(l, env, name), self.deriv(r, env, name));
                self.add(dl, dr)
            }
            // w = f - g, w' = f' - g'
            ExprNode::Sub(l, r) => {
                let (dl, dr) = (self.deriv(l, env, name), self.deriv(r, env, name));
                self.sub(dl, dr)
            }
            // w = f*g, w' = f'g + fg'
            ExprNode::Mul(l, r) => {
                let (dl, dr) = (self.deriv(l, env, name), self.deriv(r, env, name));
                let t1 = self.mul(dl, r);
                let t2 = self.mul(l, dr);
                self.add(t1, t2)
            }
            // w = f/g, w' = f'/g - g'(f/g)/g
            ExprNode::Div(l, r) => {
                let (dl, dr) = (self.deriv(l, env, name), self.deriv(r, env, name));
                let t1 = self.div(dl, r);
                let w_over_r = self.div(id, r);
                let t2 = self.mul(dr, w_over_r);
                self.sub(t1, t2)
            }
            // w = a^b, w' = w*(b'*log(a) + a'*b/a)
            ExprNode::Pow(a, b) => {
                let (da, db) = (self.deriv(a, env, name), self.deriv(b, env, name));
                let log_a = self.log_of(a);
                let t1 = self.mul(db, log_a);
                let b_over_a = self.div(b, a);
                let t2 = self.mul(da, b_over_a);
                let inner = self.add(t1, t2);
                self.mul(id, inner)
            }
        }
    }

    /// Free parameter names after expanding definitions from `env`, each
    /// DAG node visited at most once.
    pub fn params(&self, id: ExprId, env: &ParamDefs) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut acc = HashSet::new();
        self.count_refs(id, &mut visited, &mut acc, env);
        acc
    }

    fn count_refs(
        &self,
        id: ExprId,
        visited: &mut HashSet<ExprId>,
        acc: &mut HashSet<String>,
        env: &ParamDefs,
    ) {
        if !visited.insert(id) {
            return;
        }
        match self.node(id) {
            ExprNode::Int(_) | ExprNode::Double(_) => {}
            ExprNode::Param(name) => {
                if let Some(def) = env.get(name) {
                    let inner = env.exclude(name);
                    self.count_refs(def, visited, acc, &inner);
                } else {
                    acc.insert(name.clone());
                }
            }
            ExprNode::Log(a) | ExprNode::Exp(a) => {
                let a = *a;
                self.count_refs(a, visited, acc, env);
            }
            ExprNode::Add(l, r)
            | ExprNode::Sub(l, r)
            | ExprNode::Mul(l, r)
            | ExprNode::Div(l, r)
            | ExprNode::Pow(l, r) => {
                let (l, r) = (*l, *r);
                self.count_refs(l, visited, acc, env);
                self.count_refs(r, visited, acc, env);
            }
        }
    }

    // ---- JSON I/O ----------------------------------------------------------

    /// Canonical tagged-object JSON encoding (no memoisation).
    pub fn to_json(&self, id: ExprId) -> Json {
        let empty = HashMap::new();
        self.to_json_memo(id, &empty)
    }

    /// Canonical JSON encoding, replacing any node present in `memos` with a
    /// bare string reference to its assigned name.
    pub fn to_json_memo(&self, id: ExprId, memos: &HashMap<ExprId, String>) -> Json {
        if let Some(name) = memos.get(&id) {
            return Json::from(name.clone());
        }
        if self.is_zero(id) {
            return Json::from(0);
        }
        if self.is_one(id) {
            return Json::from(1);
        }
        match self.node(id) {
            ExprNode::Int(i) => Json::from(*i),
            ExprNode::Double(d) => Json::from(*d),
            ExprNode::Param(n) => Json::from(n.clone()),
            ExprNode::Log(a) => json!({ "log": self.to_json_memo(*a, memos) }),
            ExprNode::Exp(a) => json!({ "exp": self.to_json_memo(*a, memos) }),
            ExprNode::Pow(a, b) => {
                json!({ "pow": [self.to_json_memo(*a, memos), self.to_json_memo(*b, memos)] })
            }
            ExprNode::Mul(l, r) => {
                json!({ "*": [self.to_json_memo(*l, memos), self.to_json_memo(*r, memos)] })
            }
            ExprNode::Add(l, r) => {
                json!({ "+": [self.to_json_memo(*l, memos), self.to_json_memo(*r, memos)] })
            }
            ExprNode::Div(l, r) => {
                if self.is_one(*l) {
                    if let ExprNode::Sub(one_, x) = self.node(*r) {
                        if self.is_one(*one_) {
                            return json!({ "geomsum": self.to_json_memo(*x, memos) });
                        }
                    }
                }
                json!({ "/": [self.to_json_memo(*l, memos), self.to_json_memo(*r, memos)] })
            }
            ExprNode::Sub(l, r) => {
                if self.is_one(*l) {
                    return json!({ "not": self.to_json_memo(*r, memos) });
                }
                json!({ "-": [self.to_json_memo(*l, memos), self.to_json_memo(*r, memos)] })
            }
        }
    }

    /// Parses a weight expression from its canonical JSON encoding. `defs`,
    /// when given, resolves bare string references that name a definition
    /// directly to that definition's expression rather than a free `Param`.
    pub fn from_json(
        &mut self,
        j: &Json,
        defs: Option<&ParamDefs>,
    ) -> Result<ExprId, crate::error::Error> {
        if let Some(b) = j.as_bool() {
            return Ok(if b { self.one } else { self.zero });
        }
        if let Some(i) = j.as_i64() {
            return Ok(match i32::try_from(i) {
                Ok(iv) => self.int_const(iv),
                Err(_) => self.double_const(i as f64),
            });
        }
        if let Some(f) = j.as_f64() {
            return Ok(self.double_const(f));
        }
        if let Some(s) = j.as_str() {
            if let Some(defs) = defs {
                if let Some(def) = defs.get(s) {
                    return Ok(def);
                }
            }
            return Ok(self.param(s.to_string()));
        }
        if j.is_array() {
            return Err(crate::error::Error::Schema(
                "a JSON array is not a valid weight expression".into(),
            ));
        }
        let obj = j
            .as_object()
            .ok_or_else(|| crate::error::Error::Schema("weight expression must be a JSON object".into()))?;
        let (op, args) = obj
            .iter()
            .next()
            .ok_or_else(|| crate::error::Error::Schema("weight expression object has no opcode".into()))?;
        match op.as_str() {
            "log" => {
                let a = self.from_json(args, defs)?;
                Ok(self.log_of(a))
            }
            "exp" => {
                let a = self.from_json(args, defs)?;
                Ok(self.exp_of(a))
            }
            "not" => {
                let a = self.from_json(args, defs)?;
                Ok(self.negate(a))
            }
            "geomsum" => {
                let a = self.from_json(args, defs)?;
                Ok(self.geometric_sum(a))
            }
            "*" | "/" | "+" | "-" => {
                let arr = args.as_array().ok_or_else(|| {
                    crate::error::Error::Schema(format!("`{op}` expects a two-element array"))
                })?;
                if arr.len() != 2 {
                    return Err(crate::error::Error::Schema(format!(
                        "`{op}` expects exactly two operands, got {}",
                        arr.len()
                    )));
                }
                let l = self.from_json(&arr[0], defs)?;
                let r = self.from_json(&arr[1], defs)?;
                Ok(match op.as_str() {
                    "*" => self.mul(l, r),
                    "/" => self.div(l, r),
                    "+" => self.add(l, r),
                    "-" => self.sub(l, r),
                    _ => unreachable!(),
                })
            }
            other => Err(crate::error::Error::Schema(format!(
                "unknown weight-expression opcode `{other}`"
            ))),
        }
    }

    /// Reference counts of every node reachable from `roots`, each DAG edge
    /// walked once per distinct parent visit (first reach short-circuits
    /// deeper traversal, matching the source's `countRefs`). Used to decide
    /// which subexpressions are worth memoising into named `defs` when
    /// serialising a whole machine.
    pub fn ref_counts(&self, roots: &[ExprId]) -> HashMap<ExprId, u32> {
        let mut counts = HashMap::new();
        for &id in roots {
            self.count_node_refs(id, &mut counts);
        }
        counts
    }

    fn count_node_refs(&self, id: ExprId, counts: &mut HashMap<ExprId, u32>) {
        let seen_before = {
            let entry = counts.entry(id).or_insert(0);
            *entry += 1;
            *entry > 1
        };
        if seen_before {
            return;
        }
        match self.node(id) {
            ExprNode::Int(_) | ExprNode::Double(_) | ExprNode::Param(_) => {}
            ExprNode::Log(a) | ExprNode::Exp(a) => {
                let a = *a;
                self.count_node_refs(a, counts);
            }
            ExprNode::Add(l, r)
            | ExprNode::Sub(l, r)
            | ExprNode::Mul(l, r)
            | ExprNode::Div(l, r)
            | ExprNode::Pow(l, r) => {
                let (l, r) = (*l, *r);
                self.count_node_refs(l, counts);
                self.count_node_refs(r, counts);
            }
        }
    }

    /// Assigns memo names (`"_e0"`, `"_e1"`, ...) to every non-leaf node
    /// reachable from `roots` whose reference count exceeds one, returning
    /// the memo map plus the definitions in an order safe to emit (each
    /// definition's own free subexpressions are defined before it, since
    /// names are assigned in post-order).
    pub fn memoize(&self, roots: &[ExprId]) -> (HashMap<ExprId, String>, Vec<(String, ExprId)>) {
        let counts = self.ref_counts(roots);
        let mut memos = HashMap::new();
        let mut defs = Vec::new();
        let mut next = 0usize;
        let mut visited = HashSet::new();
        for &root in roots {
            self.memoize_node(root, &counts, &mut memos, &mut defs, &mut next, &mut visited);
        }
        (memos, defs)
    }

    #[allow(clippy::too_many_arguments)]
    fn memoize_node(
        &self,
        id: ExprId,
        counts: &HashMap<ExprId, u32>,
        memos: &mut HashMap<ExprId, String>,
        defs: &mut Vec<(String, ExprId)>,
        next: &mut usize,
        visited: &mut HashSet<ExprId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        match self.node(id) {
            ExprNode::Int(_) | ExprNode::Double(_) | ExprNode::Param(_) => {}
            ExprNode::Log(a) | ExprNode::Exp(a) => {
                let a = *a;
                self.memoize_node(a, counts, memos, defs, next, visited);
            }
            ExprNode::Add(l, r)
            | ExprNode::Sub(l, r)
            | ExprNode::Mul(l, r)
            | ExprNode::Div(l, r)
            | ExprNode::Pow(l, r) => {
                let (l, r) = (*l, *r);
                self.memoize_node(l, counts, memos, defs, next, visited);
                self.memoize_node(r, counts, memos, defs, next, visited);
            }
        }
        if counts.get(&id).copied().unwrap_or(0) > 1 && !matches!(self.node(id), ExprNode::Param(_)) {
            let name = format!("_e{next}");
            *next += 1;
            memos.insert(id, name.clone());
            defs.push((name, id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_constructors_fold_identities() {
        let mut a = WeightArena::new();
        let x = a.param("x");
        let zero = a.zero();
        let one = a.one();
        assert_eq!(a.add(zero, x), x);
        assert_eq!(a.mul(one, x), x);
        assert!(a.is_zero(a.mul(zero, x)));
        let two = a.int_const(2);
        let three = a.int_const(3);
        let six = a.mul(two, three);
        assert!(a.is_number(six));
        assert_eq!(a.as_double(six), 6.0);
    }

    #[test]
    fn exp_log_are_inverse() {
        let mut a = WeightArena::new();
        let x = a.param("x");
        let e = a.exp_of(x);
        let l = a.log_of(e);
        assert_eq!(l, x);
        let l2 = a.log_of(x);
        let e2 = a.exp_of(l2);
        assert_eq!(e2, x);
    }

    #[test]
    fn eval_and_bind_agree() {
        let mut a = WeightArena::new();
        let p = a.param("p");
        let expr = a.mul(p, p);
        let mut env = ParamDefs::new();
        let half = a.double_const(0.5);
        env.insert("p", half);
        let bound = a.bind(expr, &env);
        let direct = a.eval(expr, &env).unwrap();
        let via_bind = a.eval(bound, &ParamDefs::new()).unwrap();
        assert!((direct - via_bind).abs() < 1e-12);
        assert!((direct - 0.25).abs() < 1e-12);
    }

    #[test]
    fn eval_undefined_parameter_errors() {
        let a = WeightArena::new();
        let env = ParamDefs::new();
        // can't construct Param without &mut; use a scratch arena
        let mut scratch = WeightArena::new();
        let p = scratch.param("missing");
        let err = scratch.eval(p, &env).unwrap_err();
        assert_eq!(err, EvalError::Undefined("missing".into()));
        let _ = a; // silence unused in case of refactors
    }

    #[test]
    fn eval_cyclic_definition_errors() {
        let mut a = WeightArena::new();
        let mut env = ParamDefs::new();
        let p = a.param("p");
        let q = a.param("q");
        env.insert("p", q);
        env.insert("q", p);
        let err = a.eval(p, &env).unwrap_err();
        assert!(matches!(err, EvalError::Cycle(_)));
    }

    #[test]
    fn deriv_product_rule() {
        let mut a = WeightArena::new();
        let env = ParamDefs::new();
        let x = a.param("x");
        let expr = a.mul(x, x); // x^2 via mul, not pow
        let d = a.deriv(expr, &env, "x");
        // d/dx (x*x) = 1*x + x*1 = x + x = 2x after folding through add
        let mut test_env = ParamDefs::new();
        test_env.insert("x", a.double_const(3.0));
        let v = a.eval(d, &test_env).unwrap();
        assert!((v - 6.0).abs() < 1e-9);
    }

    #[test]
    fn deriv_pow_rule() {
        let mut a = WeightArena::new();
        let env = ParamDefs::new();
        let x = a.param("x");
        let three = a.int_const(3);
        let expr = a.pow(x, three); // x^3
        let d = a.deriv(expr, &env, "x");
        let mut test_env = ParamDefs::new();
        test_env.insert("x", a.double_const(2.0));
        let v = a.eval(d, &test_env).unwrap();
        // d/dx x^3 = 3x^2 = 12 at x=2
        assert!((v - 12.0).abs() < 1e-6);
    }

    #[test]
    fn json_round_trip() {
        let mut a = WeightArena::new();
        let x = a.param("x");
        let y = a.param("y");
        let sum = a.add(x, y);
        let j = a.to_json(sum);
        let mut b = WeightArena::new();
        let back = b.from_json(&j, None).unwrap();
        let mut env = ParamDefs::new();
        env.insert("x", b.double_const(2.0));
        env.insert("y", b.double_const(3.0));
        assert!((b.eval(back, &env).unwrap() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn json_geomsum_round_trip() {
        let mut a = WeightArena::new();
        let p = a.param("p");
        let gs = a.geometric_sum(p);
        let j = a.to_json(gs);
        assert_eq!(j["geomsum"], Json::from("p"));
    }

    #[test]
    fn params_expand_through_defs() {
        let mut a = WeightArena::new();
        let mut env = ParamDefs::new();
        let q = a.param("q");
        env.insert("p", q);
        let p = a.param("p");
        let free = a.params(p, &env);
        assert_eq!(free.len(), 1);
        assert!(free.contains("q"));
    }

    #[test]
    fn memoize_shares_duplicated_subexpr() {
        let mut a = WeightArena::new();
        let x = a.param("x");
        let shared = a.mul(x, x);
        let top = a.add(shared, shared);
        let (memos, defs) = a.memoize(&[top]);
        assert!(memos.contains_key(&shared));
        assert_eq!(defs.len(), 1);
    }
}
