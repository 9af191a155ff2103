//! Viterbi algorithm: the single highest-weight alignment of an
//! input/output pair, found by replacing Forward's log-sum-exp with a
//! max and tracing back the winning predecessor at each cell.

use crate::dpmatrix::DpMatrix;
use crate::envelope::{AlignPath, Envelope, SeqPair};
use crate::error::{Error, Result};
use crate::evaluated::EvaluatedMachine;
use crate::traceback::{candidates, traceback, TransSelector};

fn fill_cell(dp: &mut DpMatrix, em: &EvaluatedMachine, in_tok: &[usize], out_tok: &[usize], i: usize, o: usize, s: usize) {
    let base = if i == 0 && o == 0 && s == em.start_state() { 0.0 } else { f64::NEG_INFINITY };
    let best = candidates(dp, em, in_tok, out_tok, i, o, s)
        .into_iter()
        .fold(base, |acc, (v, _)| acc.max(v));
    dp.set(i, o, s, best);
}

/// Fills the Viterbi matrix: `dp.get(i, o, s)` is the log-weight of the
/// best path from the start state to `(i, o, s)`.
pub fn viterbi_matrix(em: &EvaluatedMachine, seq: &SeqPair, envelope: &Envelope) -> Result<DpMatrix> {
    let in_tok = em.input_tokenizer.tokenize(&seq.input.seq)?;
    let out_tok = em.output_tokenizer.tokenize(&seq.output.seq)?;
    let mut dp = DpMatrix::new(envelope.clone(), em.n_states());
    for o in 0..=envelope.out_len {
        for i in envelope.in_start[o]..envelope.in_end[o] {
            for s in 0..em.n_states() {
                fill_cell(&mut dp, em, &in_tok, &out_tok, i, o, s);
            }
        }
    }
    Ok(dp)
}

/// The best alignment's log-weight and the alignment itself.
pub fn viterbi(em: &EvaluatedMachine, seq: &SeqPair, envelope: &Envelope) -> Result<(f64, AlignPath)> {
    if !envelope.contains(seq.input.len(), seq.output.len()) {
        return Err(Error::Shape("envelope does not contain the terminal cell".into()));
    }
    let dp = viterbi_matrix(em, seq, envelope)?;
    let score = dp.get(seq.input.len(), seq.output.len(), em.end_state());
    if !score.is_finite() {
        return Err(Error::Invariant("no path through the envelope reaches the end state".into()));
    }
    let in_tok = em.input_tokenizer.tokenize(&seq.input.seq)?;
    let out_tok = em.output_tokenizer.tokenize(&seq.output.seq)?;
    let (path, _steps) = traceback(&dp, em, &in_tok, &out_tok, TransSelector::ArgMax)?;
    Ok((score, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::NamedSeq;
    use crate::forward;
    use crate::machine::{Machine, MachineTransition};
    use crate::params::ParamDefs;
    use crate::weight::WeightArena;

    #[test]
    fn single_path_viterbi_matches_forward() {
        let mut arena = WeightArena::new();
        let w = arena.double_const(0.3);
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition {
            input: Some("a".into()),
            output: Some("x".into()),
            dest: 1,
            weight: w,
        });
        let env = ParamDefs::new();
        let em = EvaluatedMachine::build(&m, &env, &arena).unwrap();
        let seq = SeqPair::new(NamedSeq::new("in", vec!["a".into()]), NamedSeq::new("out", vec!["x".into()]));
        let envelope = Envelope::full(1, 1);
        let (score, path) = viterbi(&em, &seq, &envelope).unwrap();
        let ll = forward::log_likelihood(&em, &seq, &envelope).unwrap();
        assert!((score - ll).abs() < 1e-9);
        assert_eq!(path, vec![(Some("a".to_string()), Some("x".to_string()))]);
    }

    #[test]
    fn viterbi_picks_the_heavier_of_two_parallel_transitions() {
        let mut arena = WeightArena::new();
        let light = arena.double_const(0.1);
        let heavy = arena.double_const(0.9);
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition { input: Some("a".into()), output: Some("x".into()), dest: 1, weight: light });
        m.states[0].trans.push(MachineTransition { input: Some("a".into()), output: Some("y".into()), dest: 1, weight: heavy });
        let env = ParamDefs::new();
        let em = EvaluatedMachine::build(&m, &env, &arena).unwrap();
        let seq = SeqPair::new(NamedSeq::new("in", vec!["a".into()]), NamedSeq::new("out", vec!["y".into()]));
        let envelope = Envelope::full(1, 1);
        let (score, path) = viterbi(&em, &seq, &envelope).unwrap();
        assert!((score - 0.9f64.ln()).abs() < 1e-9);
        assert_eq!(path, vec![(Some("a".to_string()), Some("y".to_string()))]);
    }
}
