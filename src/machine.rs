//! Transducer data model: states, transitions, and topological queries.
//!
//! Grounded on `machine.h`/`machine.cpp` in `original_source/` for the exact
//! `exitsWithInput`/`exitsWithoutInput`/`terminates`/`waits`/`continues`
//! predicates spec.md §3 compresses into prose; we follow the original's
//! precise definitions rather than re-derive them from the lossier summary.

use std::collections::{BTreeSet, VecDeque};

use serde_json::Value as Json;

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::params::{Constraints, ParamDefs};
use crate::weight::{ExprId, WeightArena};

/// An opaque, non-empty token from a user alphabet. Absence of a symbol on a
/// transition (silent on that tape) is represented by `Option::None` at the
/// call site, not by a distinguished `Symbol` value.
pub type Symbol = String;

/// Index of a state within a [`Machine`].
pub type StateIndex = usize;

/// Opaque JSON-like debugging/composition label; no semantic role.
pub type StateName = Json;

/// A single outgoing edge of a [`MachineState`].
#[derive(Debug, Clone, PartialEq)]
pub struct MachineTransition {
    /// Input symbol consumed, or `None` if silent on the input tape.
    pub input: Option<Symbol>,
    /// Output symbol emitted, or `None` if silent on the output tape.
    pub output: Option<Symbol>,
    /// Destination state index.
    pub dest: StateIndex,
    /// Symbolic weight of this transition.
    pub weight: ExprId,
}

impl MachineTransition {
    /// A transition is silent iff both labels are absent.
    pub fn is_silent(&self) -> bool {
        self.input.is_none() && self.output.is_none()
    }
}

/// A state: a debug/composition label plus its outgoing transitions.
#[derive(Debug, Clone, Default)]
pub struct MachineState {
    /// Opaque JSON-like name, used for debugging/composition labelling only.
    pub name: StateName,
    /// Outgoing transitions.
    pub trans: Vec<MachineTransition>,
}

impl MachineState {
    /// True if this state has at least one input-consuming outgoing transition.
    pub fn exits_with_input(&self) -> bool {
        self.trans.iter().any(|t| t.input.is_some())
    }

    /// True if this state has at least one non-input-consuming (silent or
    /// output-only) outgoing transition.
    pub fn exits_without_input(&self) -> bool {
        self.trans.iter().any(|t| t.input.is_none())
    }

    /// True if this state has no outgoing transitions at all.
    pub fn terminates(&self) -> bool {
        self.trans.is_empty()
    }

    /// "Input"/"end" state: every transition that leaves it consumes input
    /// (vacuously true for a state with no transitions).
    pub fn waits(&self) -> bool {
        !self.exits_without_input()
    }

    /// "Insert" state: cannot consume input on the way out, and has at
    /// least one outgoing transition.
    pub fn continues(&self) -> bool {
        !self.exits_with_input() && !self.terminates()
    }
}

/// A weighted finite-state transducer: states, local parameter definitions,
/// and fitting constraints.
#[derive(Debug, Clone)]
pub struct Machine {
    /// `states[0]` is the start state; `states[len-1]` is the end state.
    pub states: Vec<MachineState>,
    /// Local name bindings, consulted with precedence during evaluation.
    pub defs: ParamDefs,
    /// Fitting constraints carried through to the fitter.
    pub cons: Constraints,
}

impl Machine {
    /// A machine with `n` states, no transitions, empty defs/constraints.
    pub fn with_states(n: usize) -> Self {
        Machine {
            states: (0..n).map(|_| MachineState::default()).collect(),
            defs: ParamDefs::new(),
            cons: Constraints::new(),
        }
    }

    /// Index of the start state (always `0`).
    pub fn start_state(&self) -> StateIndex {
        0
    }

    /// Index of the end state (always `states.len() - 1`).
    pub fn end_state(&self) -> StateIndex {
        self.states.len() - 1
    }

    /// Number of states.
    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    /// Checks the structural invariants: at least one state, every
    /// transition destination in range.
    pub fn validate(&self) -> Result<()> {
        if self.states.is_empty() {
            return Err(Error::Invariant("machine has no states".into()));
        }
        let n = self.states.len();
        for (s, state) in self.states.iter().enumerate() {
            for (t, trans) in state.trans.iter().enumerate() {
                if trans.dest >= n {
                    return Err(Error::OutOfRange { index: trans.dest, len: n });
                }
                let _ = (s, t);
            }
        }
        Ok(())
    }

    /// Set of input symbols appearing on any transition.
    pub fn input_alphabet(&self) -> BTreeSet<Symbol> {
        self.states
            .iter()
            .flat_map(|s| s.trans.iter())
            .filter_map(|t| t.input.clone())
            .collect()
    }

    /// Set of output symbols appearing on any transition.
    pub fn output_alphabet(&self) -> BTreeSet<Symbol> {
        self.states
            .iter()
            .flat_map(|s| s.trans.iter())
            .filter_map(|t| t.output.clone())
            .collect()
    }

    fn forward_reachable(&self) -> Vec<bool> {
        let n = self.n_states();
        let mut seen = vec![false; n];
        let mut queue = VecDeque::new();
        seen[self.start_state()] = true;
        queue.push_back(self.start_state());
        while let Some(s) = queue.pop_front() {
            for t in &self.states[s].trans {
                if !seen[t.dest] {
                    seen[t.dest] = true;
                    queue.push_back(t.dest);
                }
            }
        }
        seen
    }

    fn backward_reachable(&self) -> Vec<bool> {
        let n = self.n_states();
        let mut incoming: Vec<Vec<StateIndex>> = vec![Vec::new(); n];
        for (s, state) in self.states.iter().enumerate() {
            for t in &state.trans {
                incoming[t.dest].push(s);
            }
        }
        let mut seen = vec![false; n];
        let mut queue = VecDeque::new();
        seen[self.end_state()] = true;
        queue.push_back(self.end_state());
        while let Some(s) = queue.pop_front() {
            for &src in &incoming[s] {
                if !seen[src] {
                    seen[src] = true;
                    queue.push_back(src);
                }
            }
        }
        seen
    }

    /// Every state is on some path from start to end.
    pub fn is_ergodic(&self) -> bool {
        let fwd = self.forward_reachable();
        let bwd = self.backward_reachable();
        fwd.iter().zip(bwd.iter()).all(|(&f, &b)| f && b)
    }

    /// States reachable from start that can also reach end; used by
    /// [`crate::topo::trim_ergodic`].
    pub(crate) fn ergodic_mask(&self) -> Vec<bool> {
        let fwd = self.forward_reachable();
        let bwd = self.backward_reachable();
        fwd.iter().zip(bwd.iter()).map(|(&f, &b)| f && b).collect()
    }

    /// Every state either waits (leaves only on input) or continues
    /// (leaves only without consuming input, and has an outgoing edge).
    pub fn is_waiting(&self) -> bool {
        self.states.iter().all(|s| s.waits() || s.continues())
    }

    /// No silent transition `(s -> d)` with `d <= s`, for `s >= 1` (the
    /// start state is exempt: a silent self-loop on state 0 cannot arise
    /// from any combinator here and checking it would make advancement
    /// non-convergent for the degenerate single-state case).
    pub fn is_advancing(&self) -> bool {
        self.states.iter().enumerate().skip(1).all(|(s, state)| {
            state.trans.iter().all(|t| !(t.is_silent() && t.dest <= s))
        })
    }
}

/// Merges transitions sharing the same `(input, output, dest)` key, summing
/// their weights via [`WeightArena::add`]. Grounded on `TransAccumulator` in
/// `original_source/src/machine.cpp`, which dedups composed/eliminated
/// transitions the same way rather than emitting parallel edges.
pub(crate) fn accumulate_transitions(trans: &[MachineTransition], arena: &mut WeightArena) -> Vec<MachineTransition> {
    let mut order: Vec<(Option<Symbol>, Option<Symbol>, StateIndex)> = Vec::new();
    let mut acc: HashMap<(Option<Symbol>, Option<Symbol>, StateIndex), ExprId> = HashMap::new();
    for t in trans {
        let key = (t.input.clone(), t.output.clone(), t.dest);
        match acc.get(&key) {
            Some(&existing) => {
                let summed = arena.add(existing, t.weight);
                acc.insert(key, summed);
            }
            None => {
                acc.insert(key.clone(), t.weight);
                order.push(key);
            }
        }
    }
    order
        .into_iter()
        .map(|key| {
            let weight = acc[&key];
            MachineTransition { input: key.0, output: key.1, dest: key.2, weight }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight::WeightArena;

    fn two_state_silent(weight: ExprId) -> Machine {
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition { input: None, output: None, dest: 1, weight });
        m
    }

    #[test]
    fn validate_rejects_out_of_range_dest() {
        let mut arena = WeightArena::new();
        let w = arena.one();
        let mut m = two_state_silent(w);
        m.states[0].trans[0].dest = 5;
        assert!(matches!(m.validate(), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn ergodic_flags_dead_state() {
        let mut arena = WeightArena::new();
        let w = arena.one();
        let mut m = Machine::with_states(3);
        m.states[0].trans.push(MachineTransition { input: None, output: None, dest: 2, weight: w });
        // state 1 unreachable and can't reach end
        assert!(!m.is_ergodic());
        let mask = m.ergodic_mask();
        assert!(mask[0] && mask[2] && !mask[1]);
    }

    #[test]
    fn waits_and_continues_are_mutually_consistent() {
        let mut arena = WeightArena::new();
        let w = arena.one();
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition {
            input: Some("a".into()),
            output: None,
            dest: 1,
            weight: w,
        });
        assert!(m.is_waiting());
        m.states[0].trans.push(MachineTransition { input: None, output: None, dest: 1, weight: w });
        // state 0 now exits both with and without input: neither waits nor continues
        assert!(!m.is_waiting());
    }

    #[test]
    fn advancing_rejects_silent_self_loop() {
        let mut arena = WeightArena::new();
        let p = arena.param("p");
        let mut m = Machine::with_states(3);
        m.states[1].trans.push(MachineTransition { input: None, output: None, dest: 1, weight: p });
        assert!(!m.is_advancing());
    }
}
