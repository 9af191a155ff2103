//! Backward walk from a filled DP matrix's terminal cell to its origin,
//! reconstructing an alignment one step at a time.
//!
//! The four predecessor cases mirror the forward/backward recurrence
//! (diagonal, input-only, output-only, silent); [`TransSelector`] decides,
//! at each step, which of several tied or competing predecessors to
//! follow — deterministic arg-max for Viterbi, or weighted sampling for
//! forward-filtering/backward-sampling over the forward matrix.

use rand::rngs::StdRng;
use rand::Rng;

use crate::dpmatrix::{log_sum_exp, DpMatrix};
use crate::envelope::AlignPath;
use crate::error::{Error, Result};
use crate::evaluated::EvaluatedMachine;
use crate::tokenizer::Tokenizer;

/// One backward step: the predecessor cell, the transition that produced
/// it (as an index into the predecessor state's transition list, for
/// counts accumulation), and the input/output tokens it consumed.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub prev_state: usize,
    pub prev_i: usize,
    pub prev_o: usize,
    pub trans_index: usize,
    pub input: Option<usize>,
    pub output: Option<usize>,
}

/// How a traceback resolves ties/competition among predecessor candidates.
pub enum TransSelector<'a> {
    /// Follows the highest-weight candidate; ties keep the first one
    /// enumerated. The deterministic Viterbi traceback.
    ArgMax,
    /// Samples a candidate with probability proportional to its weight
    /// (forward-filtering / backward-sampling).
    Stochastic(&'a mut StdRng),
}

impl<'a> TransSelector<'a> {
    fn choose(&mut self, candidates: &[(f64, Step)]) -> Step {
        match self {
            TransSelector::ArgMax => {
                let mut best = candidates[0];
                for &cur in &candidates[1..] {
                    if cur.0 > best.0 {
                        best = cur;
                    }
                }
                best.1
            }
            TransSelector::Stochastic(rng) => {
                let norm = candidates.iter().fold(f64::NEG_INFINITY, |acc, c| log_sum_exp(acc, c.0));
                let u: f64 = rng.gen();
                let mut cum = 0.0;
                for (w, step) in candidates {
                    cum += (w - norm).exp();
                    if u <= cum {
                        return *step;
                    }
                }
                candidates.last().unwrap().1
            }
        }
    }
}

/// Every predecessor of `(i, o, s)`, with its contribution's log-weight, in
/// the same four cases the forward/backward recurrence uses.
pub(crate) fn candidates(
    dp: &DpMatrix,
    em: &EvaluatedMachine,
    in_tok: &[usize],
    out_tok: &[usize],
    i: usize,
    o: usize,
    s: usize,
) -> Vec<(f64, Step)> {
    let mut out = Vec::new();
    if i > 0 && o > 0 && dp.envelope.contains(i - 1, o - 1) {
        for e in em.incoming(s, in_tok[i - 1], out_tok[o - 1]) {
            let v = dp.get(i - 1, o - 1, e.state) + e.log_weight;
            out.push((
                v,
                Step {
                    prev_state: e.state,
                    prev_i: i - 1,
                    prev_o: o - 1,
                    trans_index: e.trans_index,
                    input: Some(in_tok[i - 1]),
                    output: Some(out_tok[o - 1]),
                },
            ));
        }
    }
    if i > 0 && dp.envelope.contains(i - 1, o) {
        for e in em.incoming(s, in_tok[i - 1], Tokenizer::empty_token()) {
            let v = dp.get(i - 1, o, e.state) + e.log_weight;
            out.push((
                v,
                Step {
                    prev_state: e.state,
                    prev_i: i - 1,
                    prev_o: o,
                    trans_index: e.trans_index,
                    input: Some(in_tok[i - 1]),
                    output: None,
                },
            ));
        }
    }
    if o > 0 && dp.envelope.contains(i, o - 1) {
        for e in em.incoming(s, Tokenizer::empty_token(), out_tok[o - 1]) {
            let v = dp.get(i, o - 1, e.state) + e.log_weight;
            out.push((
                v,
                Step {
                    prev_state: e.state,
                    prev_i: i,
                    prev_o: o - 1,
                    trans_index: e.trans_index,
                    input: None,
                    output: Some(out_tok[o - 1]),
                },
            ));
        }
    }
    for e in em.incoming(s, Tokenizer::empty_token(), Tokenizer::empty_token()) {
        if e.state < s {
            let v = dp.get(i, o, e.state) + e.log_weight;
            out.push((
                v,
                Step { prev_state: e.state, prev_i: i, prev_o: o, trans_index: e.trans_index, input: None, output: None },
            ));
        }
    }
    out.retain(|(v, _)| v.is_finite());
    out
}

/// Walks backward from `(in_len, out_len, end_state)` to `(0, 0,
/// start_state)`, selecting one predecessor per step via `selector`.
/// Returns the alignment and the chosen steps, both in forward order.
pub fn traceback(
    dp: &DpMatrix,
    em: &EvaluatedMachine,
    in_tok: &[usize],
    out_tok: &[usize],
    mut selector: TransSelector<'_>,
) -> Result<(AlignPath, Vec<Step>)> {
    let mut i = dp.envelope.in_len;
    let mut o = dp.envelope.out_len;
    let mut s = em.end_state();
    let mut steps = Vec::new();
    while !(i == 0 && o == 0 && s == em.start_state()) {
        let cands = candidates(dp, em, in_tok, out_tok, i, o, s);
        if cands.is_empty() {
            return Err(Error::Invariant(format!("no predecessor for cell ({i}, {o}, {s}) during traceback")));
        }
        let step = selector.choose(&cands);
        steps.push(step);
        i = step.prev_i;
        o = step.prev_o;
        s = step.prev_state;
    }
    steps.reverse();
    let path = steps
        .iter()
        .map(|st| {
            let in_sym = st.input.and_then(|t| em.input_tokenizer.symbol_of(t).cloned());
            let out_sym = st.output.and_then(|t| em.output_tokenizer.symbol_of(t).cloned());
            (in_sym, out_sym)
        })
        .collect();
    Ok((path, steps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, NamedSeq, SeqPair};
    use crate::machine::{Machine, MachineTransition};
    use crate::params::ParamDefs;
    use crate::weight::WeightArena;

    #[test]
    fn argmax_traceback_recovers_the_only_path() {
        let mut arena = WeightArena::new();
        let w = arena.double_const(0.5);
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
        let in_tok = em.input_tokenizer.tokenize(&seq.input.seq).unwrap();
        let out_tok = em.output_tokenizer.tokenize(&seq.output.seq).unwrap();
        let mut dp = DpMatrix::new(envelope.clone(), em.n_states());
        dp.set(0, 0, 0, 0.0);
        dp.set(1, 1, 1, 0.5f64.ln());
        let (path, steps) = traceback(&dp, &em, &in_tok, &out_tok, TransSelector::ArgMax).unwrap();
        assert_eq!(path, vec![(Some("a".to_string()), Some("x".to_string()))]);
        assert_eq!(steps.len(), 1);
    }
}
