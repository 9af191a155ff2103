//! Fixed-width beam search variant of [`crate::decode::decode_ctc`]: keeps
//! only the top-`k` input prefixes by current score at each expansion,
//! trading search completeness for a bounded frontier size (spec.md
//! §4.5's "beam variant").

use crate::envelope::{Envelope, NamedSeq, SeqPair};
use crate::error::{Error, Result};
use crate::evaluated::EvaluatedMachine;
use crate::forward::forward_matrix;
use crate::machine::Symbol;

fn score_prefix(em: &EvaluatedMachine, prefix: &[usize], target: &[Symbol]) -> Result<(f64, f64)> {
    let in_syms: Vec<Symbol> = prefix
        .iter()
        .map(|&t| em.input_tokenizer.symbol_of(t).cloned().ok_or_else(|| Error::Reference("unknown input token".into())))
        .collect::<Result<_>>()?;
    let seq = SeqPair::new(NamedSeq::new("prefix", in_syms), NamedSeq::new("target", target.to_vec()));
    let envelope = Envelope::full(prefix.len(), target.len());
    let dp = forward_matrix(em, &seq, &envelope)?;
    let bound = (0..em.n_states()).map(|s| dp.get(prefix.len(), target.len(), s)).fold(f64::NEG_INFINITY, f64::max);
    let complete = dp.get(prefix.len(), target.len(), em.end_state());
    Ok((bound, complete))
}

/// Beam search with width `beam_width`, extending prefixes for up to
/// `max_steps` rounds (each round tries appending every alphabet symbol to
/// every surviving prefix). Returns the best complete sequence found.
pub fn beam_search(
    em: &EvaluatedMachine,
    target: &[Symbol],
    beam_width: usize,
    max_steps: usize,
) -> Result<(f64, Vec<Symbol>)> {
    let alphabet_tokens: Vec<usize> = (1..=em.input_tokenizer.len()).collect();
    if alphabet_tokens.is_empty() {
        return Err(Error::Invariant("machine has an empty input alphabet".into()));
    }
    if beam_width == 0 {
        return Err(Error::OutOfRange { index: 0, len: 0 });
    }

    let mut beam: Vec<(Vec<usize>, f64)> = vec![(Vec::new(), score_prefix(em, &[], target)?.0)];
    let mut best_complete = score_prefix(em, &[], target)?.1;
    let mut best_prefix: Vec<usize> = Vec::new();

    for _ in 0..max_steps {
        let mut candidates: Vec<(Vec<usize>, f64)> = Vec::new();
        for (prefix, _) in &beam {
            for &tok in &alphabet_tokens {
                let mut child = prefix.clone();
                child.push(tok);
                let (bound, complete) = score_prefix(em, &child, target)?;
                if complete > best_complete {
                    best_complete = complete;
                    best_prefix = child.clone();
                }
                if bound.is_finite() {
                    candidates.push((child, bound));
                }
            }
        }
        if candidates.is_empty() {
            break;
        }
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(beam_width);
        beam = candidates;
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
    fn beam_search_finds_the_only_matching_input() {
        let mut arena = WeightArena::new();
        let w = arena.double_const(0.7);
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition {
            input: Some("a".into()),
            output: Some("x".into()),
            dest: 1,
            weight: w,
        });
        let env = ParamDefs::new();
        let em = EvaluatedMachine::build(&m, &env, &arena).unwrap();
        let (score, decoded) = beam_search(&em, &["x".to_string()], 4, 3).unwrap();
        assert_eq!(decoded, vec!["a".to_string()]);
        assert!((score - 0.7f64.ln()).abs() < 1e-9);
    }
}
