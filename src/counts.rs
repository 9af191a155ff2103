//! Expected transition counts (the EM E-step): for every training
//! `SeqPair`, run Forward and Backward and accumulate, for each
//! transition, `exp(F(i,o,s) + log_w + B(i',o',d) - logLike)` — the
//! posterior expectation of how often that transition fires, summed over
//! every cell it could have fired from.

use crate::backward::backward_matrix;
use crate::envelope::{Envelope, SeqPair};
use crate::error::Result;
use crate::evaluated::EvaluatedMachine;
use crate::forward::forward_matrix;
use crate::tokenizer::Tokenizer;

/// Expected count per `(state, transition index within that state)`,
/// mirroring the shape of [`EvaluatedMachine::states`]' transition lists.
#[derive(Debug, Clone)]
pub struct MachineCounts {
    pub per_state: Vec<Vec<f64>>,
}

impl MachineCounts {
    pub fn zeros(em: &EvaluatedMachine) -> Self {
        MachineCounts { per_state: em.states.iter().map(|s| vec![0.0; s.n_transitions]).collect() }
    }

    pub fn add_assign(&mut self, other: &MachineCounts) {
        for (s, row) in self.per_state.iter_mut().enumerate() {
            for (t, c) in row.iter_mut().enumerate() {
                *c += other.per_state[s][t];
            }
        }
    }
}

/// Expected counts and log-likelihood for a single training example.
pub fn expected_counts(em: &EvaluatedMachine, seq: &SeqPair, envelope: &Envelope) -> Result<(MachineCounts, f64)> {
    let in_tok = em.input_tokenizer.tokenize(&seq.input.seq)?;
    let out_tok = em.output_tokenizer.tokenize(&seq.output.seq)?;
    let in_len = seq.input.len();
    let out_len = seq.output.len();

    let fwd = forward_matrix(em, seq, envelope)?;
    let bwd = backward_matrix(em, seq, envelope)?;
    let log_like = fwd.get(in_len, out_len, em.end_state());

    let mut counts = MachineCounts::zeros(em);
    if !log_like.is_finite() {
        // No path reaches the end state under this envelope; no transition
        // gets any credit.
        return Ok((counts, log_like));
    }

    for o in 0..=envelope.out_len {
        for i in envelope.in_start[o]..envelope.in_end[o] {
            for s in 0..em.n_states() {
                let f = fwd.get(i, o, s);
                if !f.is_finite() {
                    continue;
                }
                if i < in_len && o < out_len && envelope.contains(i + 1, o + 1) {
                    for e in em.outgoing(s, in_tok[i], out_tok[o]) {
                        let b = bwd.get(i + 1, o + 1, e.state);
                        let c = (f + e.log_weight + b - log_like).exp();
                        counts.per_state[s][e.trans_index] += c;
                    }
                }
                if i < in_len && envelope.contains(i + 1, o) {
                    for e in em.outgoing(s, in_tok[i], Tokenizer::empty_token()) {
                        let b = bwd.get(i + 1, o, e.state);
                        let c = (f + e.log_weight + b - log_like).exp();
                        counts.per_state[s][e.trans_index] += c;
                    }
                }
                if o < out_len && envelope.contains(i, o + 1) {
                    for e in em.outgoing(s, Tokenizer::empty_token(), out_tok[o]) {
                        let b = bwd.get(i, o + 1, e.state);
                        let c = (f + e.log_weight + b - log_like).exp();
                        counts.per_state[s][e.trans_index] += c;
                    }
                }
                for e in em.outgoing(s, Tokenizer::empty_token(), Tokenizer::empty_token()) {
                    if e.state > s {
                        let b = bwd.get(i, o, e.state);
                        let c = (f + e.log_weight + b - log_like).exp();
                        counts.per_state[s][e.trans_index] += c;
                    }
                }
            }
        }
    }
    Ok((counts, log_like))
}

/// Accumulates expected counts and total log-likelihood across an entire
/// training set.
pub fn accumulate_training_set<'a>(
    em: &EvaluatedMachine,
    examples: impl IntoIterator<Item = (&'a SeqPair, &'a Envelope)>,
) -> Result<(MachineCounts, f64)> {
    let mut total = MachineCounts::zeros(em);
    let mut log_like = 0.0;
    for (seq, envelope) in examples {
        let (counts, ll) = expected_counts(em, seq, envelope)?;
        total.add_assign(&counts);
        log_like += ll;
    }
    Ok((total, log_like))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::NamedSeq;
    use crate::machine::{Machine, MachineTransition};
    use crate::params::ParamDefs;
    use crate::weight::WeightArena;

    #[test]
    fn single_transition_gets_full_credit() {
        let mut arena = WeightArena::new();
        let w = arena.double_const(1.0);
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
        let (counts, ll) = expected_counts(&em, &seq, &envelope).unwrap();
        assert!((ll - 0.0).abs() < 1e-9);
        assert!((counts.per_state[0][0] - 1.0).abs() < 1e-9);
    }
}
