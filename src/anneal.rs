//! Simulated-annealing / MCMC decoder variant: proposes
//! substitution/insertion/deletion edits to a candidate input and accepts
//! via Metropolis-Hastings, with a temperature schedule auto-calibrated
//! during a burn-in phase toward a target acceptance rate of ~0.8
//! (spec.md §4.5).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::envelope::{Envelope, NamedSeq, SeqPair};
use crate::error::{Error, Result};
use crate::evaluated::EvaluatedMachine;
use crate::forward::log_likelihood;
use crate::machine::Symbol;

const TARGET_ACCEPTANCE: f64 = 0.8;
const CALIBRATION_WINDOW: usize = 10;
const COOLING_RATE: f64 = 0.995;

#[derive(Debug, Clone, Copy)]
enum Edit {
    Substitute,
    Insert,
    Delete,
}

fn propose(rng: &mut StdRng, current: &[usize], alphabet: &[usize]) -> Vec<usize> {
    let edit = match rng.gen_range(0..3) {
        0 => Edit::Substitute,
        1 => Edit::Insert,
        _ => Edit::Delete,
    };
    let mut out = current.to_vec();
    match edit {
        Edit::Substitute if !out.is_empty() => {
            let pos = rng.gen_range(0..out.len());
            out[pos] = alphabet[rng.gen_range(0..alphabet.len())];
        }
        Edit::Insert => {
            let pos = rng.gen_range(0..=out.len());
            out.insert(pos, alphabet[rng.gen_range(0..alphabet.len())]);
        }
        Edit::Delete if !out.is_empty() => {
            let pos = rng.gen_range(0..out.len());
            out.remove(pos);
        }
        _ => {
            // substitute/delete on an empty sequence: fall back to an insert
            // so the proposal is never a no-op.
            out.insert(0, alphabet[rng.gen_range(0..alphabet.len())]);
        }
    }
    out
}

fn score(em: &EvaluatedMachine, tokens: &[usize], target: &[Symbol]) -> Result<f64> {
    let in_syms: Vec<Symbol> = tokens
        .iter()
        .map(|&t| em.input_tokenizer.symbol_of(t).cloned().ok_or_else(|| Error::Reference("unknown input token".into())))
        .collect::<Result<_>>()?;
    let seq = SeqPair::new(NamedSeq::new("candidate", in_syms), NamedSeq::new("target", target.to_vec()));
    let envelope = Envelope::full(tokens.len(), target.len());
    log_likelihood(em, &seq, &envelope)
}

/// Searches for a high-probability input via simulated annealing, seeded
/// deterministically from `seed`. `burn_in` iterations calibrate the
/// temperature toward ~0.8 acceptance before `n_iters` further iterations
/// cool geometrically; the highest-scoring candidate seen anywhere (not
/// just the final state) is returned.
pub fn anneal_decode(
    em: &EvaluatedMachine,
    target: &[Symbol],
    seed: u64,
    burn_in: usize,
    n_iters: usize,
) -> Result<(f64, Vec<Symbol>)> {
    let alphabet: Vec<usize> = (1..=em.input_tokenizer.len()).collect();
    if alphabet.is_empty() {
        return Err(Error::Invariant("machine has an empty input alphabet".into()));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut current: Vec<usize> = vec![alphabet[0]; target.len().max(1)];
    let mut current_score = score(em, &current, target)?;
    let mut best = current.clone();
    let mut best_score = current_score;
    let mut temperature = 1.0f64;
    let mut accepted_in_window = 0usize;

    for i in 0..burn_in {
        let candidate = propose(&mut rng, &current, &alphabet);
        let cand_score = score(em, &candidate, target)?;
        let delta = cand_score - current_score;
        let accept = delta >= 0.0 || rng.gen::<f64>() < (delta / temperature).exp();
        if accept {
            accepted_in_window += 1;
            current = candidate;
            current_score = cand_score;
            if current_score > best_score {
                best_score = current_score;
                best = current.clone();
            }
        }
        if (i + 1) % CALIBRATION_WINDOW == 0 {
            let rate = accepted_in_window as f64 / CALIBRATION_WINDOW as f64;
            if rate > TARGET_ACCEPTANCE {
                temperature *= 0.9;
            } else {
                temperature *= 1.1;
            }
            accepted_in_window = 0;
        }
    }

    for _ in 0..n_iters {
        let candidate = propose(&mut rng, &current, &alphabet);
        let cand_score = score(em, &candidate, target)?;
        let delta = cand_score - current_score;
        let accept = delta >= 0.0 || rng.gen::<f64>() < (delta / temperature).exp();
        if accept {
            current = candidate;
            current_score = cand_score;
            if current_score > best_score {
                best_score = current_score;
                best = current.clone();
            }
        }
        temperature *= COOLING_RATE;
    }

    let symbols = best
        .iter()
        .map(|&t| em.input_tokenizer.symbol_of(t).cloned().expect("token came from this tokenizer"))
        .collect();
    Ok((best_score, symbols))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, MachineTransition};
    use crate::params::ParamDefs;
    use crate::weight::WeightArena;

    #[test]
    fn anneal_finds_the_only_matching_input_given_enough_iterations() {
        let mut arena = WeightArena::new();
        let w = arena.double_const(0.8);
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition {
            input: Some("a".into()),
            output: Some("x".into()),
            dest: 1,
            weight: w,
        });
        let env = ParamDefs::new();
        let em = EvaluatedMachine::build(&m, &env, &arena).unwrap();
        let (score, decoded) = anneal_decode(&em, &["x".to_string()], 42, 50, 200).unwrap();
        assert_eq!(decoded, vec!["a".to_string()]);
        assert!((score - 0.8f64.ln()).abs() < 1e-9);
    }
}
