//! A bound (parameter-free) snapshot of a [`Machine`] with log-weights
//! precomputed and incoming/outgoing transitions indexed by
//! `(input_token, output_token)` for O(1) enumeration during DP.
//!
//! Grounded on `EvaluatedMachine`/`EvaluatedMachineState` in
//! `original_source/src/eval.h`/`eval.cpp`: the `incoming`/`outgoing` maps
//! there are `map<InputToken, map<OutputToken, list<(StateIndex,
//! LogWeight)>>>`; we use `HashMap<usize, HashMap<usize, Vec<EvalEdge>>>`
//! for the same O(1)-per-label lookup without requiring `Ord` on tokens.

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::params::ParamDefs;
use crate::tokenizer::Tokenizer;
use crate::weight::WeightArena;

/// One edge of an [`EvaluatedState`]'s incoming or outgoing index: the
/// state at the other end, the transition's precomputed `ln(weight)`, and
/// the index of this transition within its *source* state's transition
/// list (shared by both the `outgoing` entry on the source and the
/// `incoming` entry on the destination, so counts accumulation can key on
/// `(source_state, trans_index)` alone).
#[derive(Debug, Clone, Copy)]
pub struct EvalEdge {
    pub state: usize,
    pub log_weight: f64,
    pub trans_index: usize,
}

/// A state's transitions, indexed by `(input_token, output_token)` in both
/// directions.
#[derive(Debug, Clone, Default)]
pub struct EvaluatedState {
    pub name: Json,
    pub outgoing: HashMap<usize, HashMap<usize, Vec<EvalEdge>>>,
    pub incoming: HashMap<usize, HashMap<usize, Vec<EvalEdge>>>,
    pub n_transitions: usize,
}

impl EvaluatedState {
    fn out_edges(&self, in_tok: usize, out_tok: usize) -> &[EvalEdge] {
        self.outgoing.get(&in_tok).and_then(|m| m.get(&out_tok)).map(Vec::as_slice).unwrap_or(&[])
    }

    fn in_edges(&self, in_tok: usize, out_tok: usize) -> &[EvalEdge] {
        self.incoming.get(&in_tok).and_then(|m| m.get(&out_tok)).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A frozen, parameter-free view of a [`Machine`], ready for DP.
/// Construction requires the machine be advancing (silent transitions only
/// ever point forward), matching spec's "no partial construction" rule.
#[derive(Debug, Clone)]
pub struct EvaluatedMachine {
    pub input_tokenizer: Tokenizer,
    pub output_tokenizer: Tokenizer,
    pub states: Vec<EvaluatedState>,
}

impl EvaluatedMachine {
    /// Binds `machine`'s transition weights against `env` (falling back to
    /// `machine.defs` with `env` taking precedence, matching `ParamDefs`'
    /// documented evaluation-environment precedence) and builds the
    /// incoming/outgoing token indices.
    pub fn build(machine: &Machine, env: &ParamDefs, arena: &WeightArena) -> Result<Self> {
        if !machine.is_advancing() {
            return Err(Error::Invariant(
                "EvaluatedMachine requires an advancing machine (no silent back-edges)".into(),
            ));
        }
        let input_tokenizer = Tokenizer::new(machine.input_alphabet());
        let output_tokenizer = Tokenizer::new(machine.output_alphabet());
        let mut states: Vec<EvaluatedState> = machine
            .states
            .iter()
            .map(|s| EvaluatedState { name: s.name.clone(), ..Default::default() })
            .collect();

        let mut merged = machine.defs.clone();
        for (name, expr) in env.iter() {
            merged.insert(name.to_string(), expr);
        }

        for (s, ms) in machine.states.iter().enumerate() {
            for (ti, trans) in ms.trans.iter().enumerate() {
                let in_tok = input_tokenizer.token_of(trans.input.as_ref())?;
                let out_tok = output_tokenizer.token_of(trans.output.as_ref())?;
                let w = arena.eval(trans.weight, &merged)?;
                if w < 0.0 {
                    return Err(Error::Numeric(format!(
                        "transition weight evaluated to a negative value ({w}); weights must be non-negative"
                    )));
                }
                let log_weight = w.ln();
                let edge = EvalEdge { state: trans.dest, log_weight, trans_index: ti };
                states[s]
                    .outgoing
                    .entry(in_tok)
                    .or_default()
                    .entry(out_tok)
                    .or_default()
                    .push(edge);
                let back_edge = EvalEdge { state: s, log_weight, trans_index: ti };
                states[trans.dest]
                    .incoming
                    .entry(in_tok)
                    .or_default()
                    .entry(out_tok)
                    .or_default()
                    .push(back_edge);
            }
            states[s].n_transitions = ms.trans.len();
        }

        Ok(EvaluatedMachine { input_tokenizer, output_tokenizer, states })
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    pub fn start_state(&self) -> usize {
        0
    }

    pub fn end_state(&self) -> usize {
        self.states.len() - 1
    }

    /// Incoming edges into `dest` labelled `(in_tok, out_tok)`.
    pub fn incoming(&self, dest: usize, in_tok: usize, out_tok: usize) -> &[EvalEdge] {
        self.states[dest].in_edges(in_tok, out_tok)
    }

    /// Outgoing edges from `src` labelled `(in_tok, out_tok)`.
    pub fn outgoing(&self, src: usize, in_tok: usize, out_tok: usize) -> &[EvalEdge] {
        self.states[src].out_edges(in_tok, out_tok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineTransition;

    #[test]
    fn rejects_non_advancing_machine() {
        let mut arena = WeightArena::new();
        let p = arena.param("p");
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition { input: None, output: None, dest: 0, weight: p });
        let env = ParamDefs::new();
        assert!(EvaluatedMachine::build(&m, &env, &arena).is_err());
    }

    #[test]
    fn builds_incoming_and_outgoing_indices() {
        let mut arena = WeightArena::new();
        let p = arena.param("p");
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition {
            input: Some("a".into()),
            output: Some("x".into()),
            dest: 1,
            weight: p,
        });
        let mut env = ParamDefs::new();
        env.insert("p", arena.double_const(0.5));
        let em = EvaluatedMachine::build(&m, &env, &arena).unwrap();
        let in_tok = em.input_tokenizer.token_of(Some(&"a".to_string())).unwrap();
        let out_tok = em.output_tokenizer.token_of(Some(&"x".to_string())).unwrap();
        let out_edges = em.outgoing(0, in_tok, out_tok);
        assert_eq!(out_edges.len(), 1);
        assert!((out_edges[0].log_weight - 0.5f64.ln()).abs() < 1e-12);
        let in_edges = em.incoming(1, in_tok, out_tok);
        assert_eq!(in_edges.len(), 1);
        assert_eq!(in_edges[0].state, 0);
    }
}
