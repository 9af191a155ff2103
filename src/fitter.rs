//! M-step parameter optimisation and the outer EM loop.
//!
//! Constraints are eliminated by reparameterising onto an unconstrained
//! vector `x`: each normalisation group's `(p_1, ..., p_k)` becomes `k-1`
//! stick-breaking coordinates via `z_i = exp(-x_i^2)`, and each rate
//! parameter `r` becomes `r = x^2` (spec.md §4.4). The reparameterised
//! objective `Sum_t c_t * log w_t(theta(x))` and its gradient are built as
//! ordinary `WeightExpr`s via [`WeightArena::bind`]/[`WeightArena::deriv`],
//! then evaluated numerically at each BFGS iteration — there is no
//! dedicated optimisation crate in this stack, so the solver is hand-rolled
//! the way the rest of this crate's numerics are: symbolic assembly, then a
//! plain `f64` loop.

use std::collections::HashMap;

use tracing::debug;

use crate::counts::{expected_counts, MachineCounts};
use crate::envelope::{Envelope, SeqPair};
use crate::error::{Error, Result};
use crate::evaluated::EvaluatedMachine;
use crate::machine::Machine;
use crate::params::ParamDefs;
use crate::weight::{ExprId, WeightArena};

const LINE_SEARCH_TOL: f64 = 1e-4;
const GRADIENT_TOL: f64 = 1e-3;
const MAX_BFGS_ITERS: usize = 100;
const MAX_EM_ITERS: usize = 1000;
const EM_REL_IMPROVEMENT_TOL: f64 = 1e-3;

/// The unconstrained-to-constrained substitution built from a machine's
/// [`crate::params::Constraints`]: a map from every constrained parameter
/// name to an expression over fresh `x`-parameter names, plus those names
/// in a fixed evaluation order.
struct Reparam {
    defs: ParamDefs,
    x_names: Vec<String>,
}

fn build_reparam(arena: &mut WeightArena, machine: &Machine) -> Reparam {
    let mut defs = ParamDefs::new();
    let mut x_names = Vec::new();

    for (gi, group) in machine.cons.norm.iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        let mut prefix = arena.one();
        for (j, name) in group.iter().enumerate() {
            if j + 1 == group.len() {
                defs.insert(name.clone(), prefix);
                break;
            }
            let xname = format!("__x_norm{gi}_{j}");
            x_names.push(xname.clone());
            let x = arena.param(xname);
            let x2 = arena.mul(x, x);
            let neg_x2 = arena.minus(x2);
            let z = arena.exp_of(neg_x2);
            let one_minus_z = arena.sub(arena.one(), z);
            let p = arena.mul(one_minus_z, prefix);
            defs.insert(name.clone(), p);
            prefix = arena.mul(prefix, z);
        }
    }

    for name in &machine.cons.rate {
        let xname = format!("__x_rate_{name}");
        x_names.push(xname.clone());
        let x = arena.param(xname);
        let r = arena.mul(x, x);
        defs.insert(name.clone(), r);
    }

    Reparam { defs, x_names }
}

/// Inverts the reparameterisation at `initial` (numeric values for every
/// constrained name) to produce a starting `x` vector. Falls back to `0.0`
/// (the stick-breaking midpoint / `r = 0`) for any coordinate whose
/// starting value can't be inverted cleanly (e.g. a simplex vertex).
fn invert_reparam(machine: &Machine, initial: &HashMap<String, f64>) -> HashMap<String, f64> {
    let mut x = HashMap::new();
    for (gi, group) in machine.cons.norm.iter().enumerate() {
        let mut prefix = 1.0f64;
        for (j, name) in group.iter().enumerate() {
            if j + 1 == group.len() {
                break;
            }
            let p = initial.get(name).copied().unwrap_or(0.0).max(0.0);
            let z = if prefix > 0.0 { (1.0 - p / prefix).clamp(1e-9, 1.0) } else { 1.0 };
            let xval = (-z.ln()).max(0.0).sqrt();
            x.insert(format!("__x_norm{gi}_{j}"), xval);
            prefix *= z;
        }
    }
    for name in &machine.cons.rate {
        let r = initial.get(name).copied().unwrap_or(0.0).max(0.0);
        x.insert(format!("__x_rate_{name}"), r.sqrt());
    }
    x
}

/// Builds the counts-weighted log-likelihood objective, already bound down
/// to depend only on the reparameterisation's `x`-names.
fn build_objective(
    arena: &mut WeightArena,
    machine: &Machine,
    counts: &MachineCounts,
    fixed: &ParamDefs,
    reparam: &Reparam,
) -> ExprId {
    let mut env = machine.defs.clone();
    for (name, expr) in fixed.iter() {
        env.insert(name.to_string(), expr);
    }
    for (name, expr) in reparam.defs.iter() {
        env.insert(name.to_string(), expr);
    }

    let mut obj = arena.zero();
    for (s, state) in machine.states.iter().enumerate() {
        for (t, trans) in state.trans.iter().enumerate() {
            let c = counts.per_state[s][t];
            if c == 0.0 {
                continue;
            }
            let bound = arena.bind(trans.weight, &env);
            let log_w = arena.log_of(bound);
            let c_expr = arena.double_const(c);
            let term = arena.mul(c_expr, log_w);
            obj = arena.add(obj, term);
        }
    }
    obj
}

/// Numerically evaluates `expr` with each `x_names[i]` bound to `x[i]`.
fn eval_with_values(arena: &mut WeightArena, expr: ExprId, x_names: &[String], x: &[f64]) -> Result<f64> {
    let mut env = ParamDefs::new();
    for (name, &v) in x_names.iter().zip(x) {
        let c = arena.double_const(v);
        env.insert(name.clone(), c);
    }
    arena.eval(expr, &env).map_err(Error::from)
}

fn gradient(
    arena: &mut WeightArena,
    obj: ExprId,
    x_names: &[String],
    x: &[f64],
) -> Result<(f64, Vec<f64>)> {
    let value = eval_with_values(arena, obj, x_names, x)?;
    let empty = ParamDefs::new();
    let mut grad = Vec::with_capacity(x_names.len());
    for name in x_names {
        let d = arena.deriv(obj, &empty, name);
        grad.push(eval_with_values(arena, d, x_names, x)?);
    }
    Ok((value, grad))
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mat_vec(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    m.iter().map(|row| dot(row, v)).collect()
}

/// Minimises `f` (here, the negated M-step objective) from `x0` via BFGS
/// with an identity-initialised inverse-Hessian approximation and a simple
/// backtracking line search, stopping when the gradient norm drops below
/// [`GRADIENT_TOL`] or [`MAX_BFGS_ITERS`] is reached.
fn bfgs_minimize(
    arena: &mut WeightArena,
    neg_obj: ExprId,
    x_names: &[String],
    x0: Vec<f64>,
) -> Result<Vec<f64>> {
    let n = x0.len();
    if n == 0 {
        return Ok(x0);
    }
    let mut x = x0;
    let mut h: Vec<Vec<f64>> = (0..n).map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect()).collect();
    let (mut f, mut g) = gradient(arena, neg_obj, x_names, &x)?;

    for _ in 0..MAX_BFGS_ITERS {
        let gnorm: f64 = g.iter().map(|v| v * v).sum::<f64>().sqrt();
        if gnorm < GRADIENT_TOL {
            break;
        }
        let dir: Vec<f64> = mat_vec(&h, &g).iter().map(|v| -v).collect();

        // backtracking line search (Armijo-style) against LINE_SEARCH_TOL.
        let mut step = 1.0f64;
        let directional = dot(&g, &dir);
        let (mut x_new, mut f_new, mut g_new);
        loop {
            x_new = x.iter().zip(&dir).map(|(xi, di)| xi + step * di).collect::<Vec<_>>();
            let eval = gradient(arena, neg_obj, x_names, &x_new)?;
            f_new = eval.0;
            g_new = eval.1;
            if f_new <= f + LINE_SEARCH_TOL * step * directional || step < 1e-10 {
                break;
            }
            step *= 0.5;
        }

        let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy.abs() > 1e-12 {
            // standard BFGS inverse-Hessian update.
            let hy = mat_vec(&h, &y);
            let yhy = dot(&y, &hy);
            let rho = 1.0 / sy;
            let mut h_new = vec![vec![0.0; n]; n];
            for i in 0..n {
                for j in 0..n {
                    h_new[i][j] = h[i][j] + (rho * rho * yhy + rho) * s[i] * s[j]
                        - rho * (hy[i] * s[j] + s[i] * hy[j]);
                }
            }
            h = h_new;
        }

        x = x_new;
        f = f_new;
        g = g_new;
    }
    Ok(x)
}

/// Runs one M-step: given expected transition counts and the current
/// numeric value of every parameter (constrained or not), returns updated
/// numeric values for every constrained parameter. Unconstrained
/// parameters are left untouched by the M-step in this formulation (they
/// are optimisation-free inputs, e.g. fixed hyperparameters); callers that
/// want them fit too should add them as trivial one-element rate groups.
pub fn m_step(
    arena: &mut WeightArena,
    machine: &Machine,
    counts: &MachineCounts,
    current: &HashMap<String, f64>,
) -> Result<HashMap<String, f64>> {
    let reparam = build_reparam(arena, machine);
    let mut fixed = ParamDefs::new();
    for (name, &v) in current {
        if machine.cons.all_names().any(|n| n == name.as_str()) {
            continue;
        }
        fixed.insert(name.clone(), arena.double_const(v));
    }

    let obj = build_objective(arena, machine, counts, &fixed, &reparam);
    let neg_obj = arena.minus(obj);

    let x0_map = invert_reparam(machine, current);
    let x0: Vec<f64> = reparam.x_names.iter().map(|n| x0_map.get(n).copied().unwrap_or(0.0)).collect();
    let x_star = bfgs_minimize(arena, neg_obj, &reparam.x_names, x0)?;

    let mut x_env = ParamDefs::new();
    for (name, &v) in reparam.x_names.iter().zip(&x_star) {
        x_env.insert(name.clone(), arena.double_const(v));
    }
    let mut updated = current.clone();
    for (name, expr) in reparam.defs.iter() {
        updated.insert(name.to_string(), arena.eval(expr, &x_env)?);
    }
    Ok(updated)
}

fn to_param_defs(arena: &mut WeightArena, values: &HashMap<String, f64>) -> ParamDefs {
    let mut defs = ParamDefs::new();
    for (name, &v) in values {
        defs.insert(name.clone(), arena.double_const(v));
    }
    defs
}

/// Runs expectation-maximisation to convergence: alternates accumulating
/// expected counts across `training` (E-step) with an M-step optimisation,
/// stopping when the relative log-likelihood improvement drops below
/// [`EM_REL_IMPROVEMENT_TOL`] or [`MAX_EM_ITERS`] is reached. Returns the
/// fitted numeric parameter values and the final log-likelihood.
pub fn fit_em(
    arena: &mut WeightArena,
    machine: &Machine,
    initial: HashMap<String, f64>,
    training: &[(SeqPair, Envelope)],
) -> Result<(HashMap<String, f64>, f64)> {
    let mut current = initial;
    let mut prev_ll = f64::NEG_INFINITY;

    for iteration in 0..MAX_EM_ITERS {
        let param_defs = to_param_defs(arena, &current);
        let em = EvaluatedMachine::build(machine, &param_defs, arena)?;

        let mut total_counts = MachineCounts::zeros(&em);
        let mut ll = 0.0;
        for (seq, envelope) in training {
            let (c, l) = expected_counts(&em, seq, envelope)?;
            total_counts.add_assign(&c);
            ll += l;
        }

        tracing::info!(iteration, log_like = ll, "EM iteration");

        if prev_ll.is_finite() {
            let improvement = (ll - prev_ll).abs() / prev_ll.abs().max(1.0);
            if improvement < EM_REL_IMPROVEMENT_TOL {
                debug!(iteration, improvement, "EM converged");
                return Ok((current, ll));
            }
        }
        prev_ll = ll;

        current = m_step(arena, machine, &total_counts, &current)?;
    }
    Ok((current, prev_ll))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::NamedSeq;
    use crate::machine::MachineTransition;
    use crate::params::Constraints;

    #[test]
    fn fits_a_single_rate_parameter_toward_the_data() {
        let mut arena = WeightArena::new();
        let r = arena.param("r");
        let mut machine = Machine::with_states(2);
        machine.states[0].trans.push(MachineTransition {
            input: Some("a".into()),
            output: Some("x".into()),
            dest: 1,
            weight: r,
        });
        machine.cons = Constraints { norm: vec![], rate: vec!["r".to_string()] };

        let seq = SeqPair::new(NamedSeq::new("in", vec!["a".into()]), NamedSeq::new("out", vec!["x".into()]));
        let envelope = Envelope::full(1, 1);
        let training = vec![(seq, envelope)];

        let mut initial = HashMap::new();
        initial.insert("r".to_string(), 0.5);
        let (fitted, ll) = fit_em(&mut arena, &machine, initial, &training).unwrap();

        // the only transition out of the start state has weight r; the
        // unique path through the machine has probability r, so the
        // likelihood-maximising value pushes r toward 1.
        assert!(fitted["r"] > 0.9);
        assert!(ll > f64::NEG_INFINITY);
    }
}
