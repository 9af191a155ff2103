//! Backward algorithm: mirrors [`crate::forward`], filling from the
//! terminal cell back to the origin using outgoing transitions. Needed
//! alongside Forward to accumulate expected transition counts for the
//! E-step (see [`crate::counts`]).

use crate::dpmatrix::{log_sum_exp, DpMatrix};
use crate::envelope::{Envelope, SeqPair};
use crate::error::{Error, Result};
use crate::evaluated::EvaluatedMachine;
use crate::tokenizer::Tokenizer;

fn fill_cell(
    dp: &mut DpMatrix,
    em: &EvaluatedMachine,
    in_tok: &[usize],
    out_tok: &[usize],
    in_len: usize,
    out_len: usize,
    i: usize,
    o: usize,
    s: usize,
) {
    let mut acc = if i == in_len && o == out_len && s == em.end_state() { 0.0 } else { f64::NEG_INFINITY };

    if i < in_len && o < out_len && dp.envelope.contains(i + 1, o + 1) {
        for e in em.outgoing(s, in_tok[i], out_tok[o]) {
            acc = log_sum_exp(acc, dp.get(i + 1, o + 1, e.state) + e.log_weight);
        }
    }
    if i < in_len && dp.envelope.contains(i + 1, o) {
        for e in em.outgoing(s, in_tok[i], Tokenizer::empty_token()) {
            acc = log_sum_exp(acc, dp.get(i + 1, o, e.state) + e.log_weight);
        }
    }
    if o < out_len && dp.envelope.contains(i, o + 1) {
        for e in em.outgoing(s, Tokenizer::empty_token(), out_tok[o]) {
            acc = log_sum_exp(acc, dp.get(i, o + 1, e.state) + e.log_weight);
        }
    }
    for e in em.outgoing(s, Tokenizer::empty_token(), Tokenizer::empty_token()) {
        if e.state > s {
            acc = log_sum_exp(acc, dp.get(i, o, e.state) + e.log_weight);
        }
    }
    dp.set(i, o, s, acc);
}

/// Computes the full backward matrix over `envelope`. States within a
/// column are visited in decreasing index order so that a silent
/// transition's destination (always a higher index, by advancingness) has
/// already been filled.
pub fn backward_matrix(em: &EvaluatedMachine, seq: &SeqPair, envelope: &Envelope) -> Result<DpMatrix> {
    if !envelope.contains(seq.input.len(), seq.output.len()) {
        return Err(Error::Shape("envelope does not contain the terminal cell".into()));
    }
    let in_tok = em.input_tokenizer.tokenize(&seq.input.seq)?;
    let out_tok = em.output_tokenizer.tokenize(&seq.output.seq)?;
    let in_len = seq.input.len();
    let out_len = seq.output.len();
    let mut dp = DpMatrix::new(envelope.clone(), em.n_states());

    for o in (0..=envelope.out_len).rev() {
        for i in (envelope.in_start[o]..envelope.in_end[o]).rev() {
            for s in (0..em.n_states()).rev() {
                fill_cell(&mut dp, em, &in_tok, &out_tok, in_len, out_len, i, o, s);
            }
        }
    }
    Ok(dp)
}

/// Total log-probability, read off the backward matrix's origin cell; must
/// agree with [`crate::forward::log_likelihood`] up to floating-point error.
pub fn log_likelihood(em: &EvaluatedMachine, seq: &SeqPair, envelope: &Envelope) -> Result<f64> {
    let dp = backward_matrix(em, seq, envelope)?;
    Ok(dp.get(0, 0, em.start_state()))
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
    fn backward_agrees_with_forward() {
        let mut arena = WeightArena::new();
        let w = arena.double_const(0.6);
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
        let fwd = forward::log_likelihood(&em, &seq, &envelope).unwrap();
        let bwd = log_likelihood(&em, &seq, &envelope).unwrap();
        assert!((fwd - bwd).abs() < 1e-9);
    }
}
