//! Prefix-tree (CTC-style) decoder: given a bound machine and a target
//! output sequence, search for the input sequence of maximum marginal
//! probability.
//!
//! Grounded on spec.md §4.5. Each search node is an explicit input prefix;
//! `seqCell`/`prefixCell` are read directly off a [`forward_matrix`] run
//! over that prefix as a complete input (`in_len = prefix.len()`) against
//! the target output — `prefixCell(o, d) = dp.get(prefix.len(), o, d)`
//! already accounts for "any continuation using only silent/output-only
//! transitions", because the forward recurrence lets `o` advance at a
//! fixed `i`. The priority queue explores prefixes by that bound, on the
//! standard assumption (true of every probability semiring) that
//! extending a prefix with more real input symbols can only multiply its
//! score by further weights `<= 1`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::envelope::{Envelope, NamedSeq, SeqPair};
use crate::error::{Error, Result};
use crate::evaluated::EvaluatedMachine;
use crate::forward::forward_matrix;
use crate::machine::Symbol;

/// Safety valve on the number of prefixes expanded, independent of the
/// priority-queue termination rule (spec.md's rule assumes per-symbol
/// weights `<= 1`; this bounds runaway search if that assumption is
/// violated by a machine the caller supplies).
const DEFAULT_MAX_EXPANSIONS: usize = 10_000;

#[derive(Debug, Clone)]
struct Node {
    prefix: Vec<usize>,
    priority: f64,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}
impl Eq for Node {}
impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.partial_cmp(&other.priority).unwrap_or(Ordering::Equal)
    }
}

fn run_forward(em: &EvaluatedMachine, prefix: &[usize], target_syms: &[Symbol]) -> Result<(crate::dpmatrix::DpMatrix, usize, usize)> {
    let in_syms: Vec<Symbol> = prefix
        .iter()
        .map(|&t| em.input_tokenizer.symbol_of(t).cloned().ok_or_else(|| Error::Reference("unknown input token".into())))
        .collect::<Result<_>>()?;
    let seq = SeqPair::new(NamedSeq::new("prefix", in_syms), NamedSeq::new("target", target_syms.to_vec()));
    let envelope = Envelope::full(prefix.len(), target_syms.len());
    let dp = forward_matrix(em, &seq, &envelope)?;
    Ok((dp, prefix.len(), target_syms.len()))
}

/// `(prefixCell bound, complete-sequence score)` for `prefix` against
/// `target_syms`: the max over states of the forward value at
/// `(prefix.len(), out_len)`, and that same value restricted to the end
/// state.
fn node_scores(em: &EvaluatedMachine, prefix: &[usize], target_syms: &[Symbol]) -> Result<(f64, f64)> {
    let (dp, i, o) = run_forward(em, prefix, target_syms)?;
    let bound = (0..em.n_states()).map(|s| dp.get(i, o, s)).fold(f64::NEG_INFINITY, f64::max);
    let complete = dp.get(i, o, em.end_state());
    Ok((bound, complete))
}

/// Searches for the input sequence of maximum marginal probability that
/// emits exactly `target`. Returns the best complete sequence's log-score
/// and the decoded input symbols.
pub fn decode_ctc(em: &EvaluatedMachine, target: &[Symbol]) -> Result<(f64, Vec<Symbol>)> {
    decode_ctc_bounded(em, target, DEFAULT_MAX_EXPANSIONS)
}

/// As [`decode_ctc`], with an explicit cap on the number of prefixes
/// expanded.
pub fn decode_ctc_bounded(em: &EvaluatedMachine, target: &[Symbol], max_expansions: usize) -> Result<(f64, Vec<Symbol>)> {
    let alphabet_tokens: Vec<usize> = (1..=em.input_tokenizer.len()).collect();
    if alphabet_tokens.is_empty() {
        return Err(Error::Invariant("machine has an empty input alphabet".into()));
    }

    let mut heap = BinaryHeap::new();
    let (root_priority, root_complete) = node_scores(em, &[], target)?;
    heap.push(Node { prefix: Vec::new(), priority: root_priority });

    let mut best_complete = root_complete;
    let mut best_prefix: Vec<usize> = Vec::new();

    for _ in 0..max_expansions {
        let Some(node) = heap.pop() else { break };
        tracing::debug!(prefix_len = node.prefix.len(), priority = node.priority, "expanding prefix");
        if best_complete.is_finite() && node.priority <= best_complete {
            break;
        }
        for &tok in &alphabet_tokens {
            let mut child = node.prefix.clone();
            child.push(tok);
            let (bound, complete) = node_scores(em, &child, target)?;
            if complete > best_complete {
                best_complete = complete;
                best_prefix = child.clone();
            }
            if bound.is_finite() {
                heap.push(Node { prefix: child, priority: bound });
            }
        }
    }

    let symbols = best_prefix
        .iter()
        .map(|&t| em.input_tokenizer.symbol_of(t).cloned().expect("token came from this tokenizer"))
        .collect();
    Ok((best_complete, symbols))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, MachineTransition};
    use crate::params::ParamDefs;
    use crate::weight::WeightArena;

    #[test]
    fn decodes_the_only_matching_input() {
        let mut arena = WeightArena::new();
        let w = arena.double_const(0.9);
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition {
            input: Some("a".into()),
            output: Some("x".into()),
            dest: 1,
            weight: w,
        });
        let env = ParamDefs::new();
        let em = EvaluatedMachine::build(&m, &env, &arena).unwrap();
        let (score, decoded) = decode_ctc(&em, &["x".to_string()]).unwrap();
        assert_eq!(decoded, vec!["a".to_string()]);
        assert!((score - 0.9f64.ln()).abs() < 1e-9);
    }
}
