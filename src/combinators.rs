//! Primitive machines and the algebra over them: concatenation, union,
//! Kleene `*`/`+`/`?`, composition, intersection, reversal, transposition,
//! and per-symbol weight scaling.
//!
//! Grounded directly on the corresponding `Machine::` static methods in
//! `original_source/src/machine.cpp` (`generator`, `acceptor`,
//! `concatenate`, `takeUnion`, `zeroOrOne`, `kleenePlus`/`kleeneStar`/
//! `kleeneLoop`, `compose`, `intersect`, `reverse`, `flipInOut`, `null`,
//! `singleTransition`); `weight_inputs`/`weight_outputs` follow the macro
//! contract declared in `machine.h` (`%` -> symbol, `#` -> alphabet size)
//! since that pair's body lives outside the retrieved source subset.

use std::collections::BTreeMap;

use serde_json::json;

use crate::machine::{accumulate_transitions, Machine, MachineState, MachineTransition, StateIndex, Symbol};
use crate::topo::{trim_ergodic, waiting_machine, SilentCycleStrategy};
use crate::weight::{ExprId, WeightArena};

/// The one-state, no-transition machine: the multiplicative identity for
/// concatenation and an absorbing building block for the other combinators.
pub fn null() -> Machine {
    Machine::with_states(1)
}

/// Two states joined by a single silent transition of the given weight.
pub fn single_transition(arena: &mut WeightArena, weight: ExprId) -> Machine {
    let mut m = Machine::with_states(2);
    m.states[0].name = json!("trans-start");
    m.states[1].name = json!("trans-end");
    m.states[0].trans.push(MachineTransition { input: None, output: None, dest: 1, weight });
    let _ = arena;
    m
}

/// A linear chain emitting `seq` on the output tape, silent on input.
pub fn generator(name: &str, seq: &[Symbol], arena: &mut WeightArena) -> Machine {
    let one = arena.one();
    let mut m = Machine::with_states(seq.len() + 1);
    for (pos, state) in m.states.iter_mut().enumerate() {
        state.name = json!([name, pos]);
    }
    for (pos, sym) in seq.iter().enumerate() {
        m.states[pos].trans.push(MachineTransition {
            input: None,
            output: Some(sym.clone()),
            dest: pos + 1,
            weight: one,
        });
    }
    m
}

/// A linear chain consuming `seq` on the input tape, silent on output.
pub fn acceptor(name: &str, seq: &[Symbol], arena: &mut WeightArena) -> Machine {
    let one = arena.one();
    let mut m = Machine::with_states(seq.len() + 1);
    for (pos, state) in m.states.iter_mut().enumerate() {
        state.name = json!([name, pos]);
    }
    for (pos, sym) in seq.iter().enumerate() {
        m.states[pos].trans.push(MachineTransition {
            input: Some(sym.clone()),
            output: None,
            dest: pos + 1,
            weight: one,
        });
    }
    m
}

/// Single-state machine with one output-only self-loop per symbol of `alphabet`,
/// each weighted 1: the "emit any one symbol" building block used to turn a
/// [`generator`]/[`acceptor`] chain into a wildcard match over a whole alphabet.
pub fn wild_generator(name: &str, alphabet: &[Symbol], arena: &mut WeightArena) -> Machine {
    let one = arena.one();
    let mut m = Machine::with_states(1);
    m.states[0].name = json!(name);
    for sym in alphabet {
        m.states[0].trans.push(MachineTransition { input: None, output: Some(sym.clone()), dest: 0, weight: one });
    }
    m
}

/// Single-state machine with one input-only self-loop per symbol of `alphabet`,
/// each weighted 1: the input-tape dual of [`wild_generator`].
pub fn wild_recognizer(name: &str, alphabet: &[Symbol], arena: &mut WeightArena) -> Machine {
    let one = arena.one();
    let mut m = Machine::with_states(1);
    m.states[0].name = json!(name);
    for sym in alphabet {
        m.states[0].trans.push(MachineTransition { input: Some(sym.clone()), output: None, dest: 0, weight: one });
    }
    m
}

fn tag_name(name: &serde_json::Value, tag: &str) -> serde_json::Value {
    if name.is_null() {
        name.clone()
    } else {
        json!([tag, name])
    }
}

fn import_defs(into: &mut Machine, from: &Machine) {
    for (name, expr) in from.defs.iter() {
        into.defs.insert(name.to_string(), expr);
    }
    into.cons.norm.extend(from.cons.norm.iter().cloned());
    into.cons.rate.extend(from.cons.rate.iter().cloned());
}

/// Sequential composition of transducer *languages* (not to be confused
/// with [`compose`]): run `left` to completion, then `right`.
pub fn concatenate(left: &Machine, right: &Machine, arena: &mut WeightArena) -> Machine {
    let one = arena.one();
    let mut m = left.clone();
    import_defs(&mut m, right);
    for state in m.states.iter_mut() {
        state.name = tag_name(&state.name, "concat-l");
    }
    let shift = left.n_states();
    for state in &right.states {
        let mut shifted = MachineState { name: tag_name(&state.name, "concat-r"), trans: Vec::new() };
        for t in &state.trans {
            shifted.trans.push(MachineTransition {
                input: t.input.clone(),
                output: t.output.clone(),
                dest: t.dest + shift,
                weight: t.weight,
            });
        }
        m.states.push(shifted);
    }
    let left_end = left.end_state();
    let right_start = shift + right.start_state();
    m.states[left_end].trans.push(MachineTransition { input: None, output: None, dest: right_start, weight: one });
    m
}

/// Nondeterministic choice between `first` and `second`, entered with
/// probability `p_first` / `1 - p_first` respectively (defaults to an even
/// `1`/`1` split when omitted, matching the unweighted `takeUnion`
/// overload — callers that want a normalised choice should bind a
/// parameter for `p_first` and let the fitter learn it).
pub fn take_union(first: &Machine, second: &Machine, weights: Option<(ExprId, ExprId)>, arena: &mut WeightArena) -> Machine {
    let (p_first, p_second) = match weights {
        Some((a, b)) => (a, b),
        None => (arena.one(), arena.one()),
    };
    let one = arena.one();
    let mut m = Machine::with_states(0);
    import_defs(&mut m, first);
    import_defs(&mut m, second);
    m.states.push(MachineState::default());
    for state in &first.states {
        m.states.push(MachineState { name: tag_name(&state.name, "union-1"), trans: Vec::new() });
    }
    for state in &second.states {
        m.states.push(MachineState { name: tag_name(&state.name, "union-2"), trans: Vec::new() });
    }
    m.states.push(MachineState::default());

    let first_base = 1;
    let second_base = 1 + first.n_states();
    let final_state = m.states.len() - 1;

    for (i, state) in first.states.iter().enumerate() {
        for t in &state.trans {
            m.states[first_base + i].trans.push(MachineTransition {
                input: t.input.clone(),
                output: t.output.clone(),
                dest: t.dest + first_base,
                weight: t.weight,
            });
        }
    }
    for (i, state) in second.states.iter().enumerate() {
        for t in &state.trans {
            m.states[second_base + i].trans.push(MachineTransition {
                input: t.input.clone(),
                output: t.output.clone(),
                dest: t.dest + second_base,
                weight: t.weight,
            });
        }
    }

    m.states[0].trans.push(MachineTransition { input: None, output: None, dest: first_base, weight: p_first });
    m.states[0].trans.push(MachineTransition { input: None, output: None, dest: second_base, weight: p_second });
    m.states[first_base + first.end_state()].trans.push(MachineTransition {
        input: None,
        output: None,
        dest: final_state,
        weight: one,
    });
    m.states[second_base + second.end_state()].trans.push(MachineTransition {
        input: None,
        output: None,
        dest: final_state,
        weight: one,
    });
    m
}

/// `q?`: accept the empty sequence as well as anything `q` accepts.
pub fn zero_or_one(q: &Machine, arena: &mut WeightArena) -> Machine {
    let one = arena.one();
    let mut m = q.clone();
    if !m.states[m.end_state()].terminates() {
        for state in m.states.iter_mut() {
            state.name = tag_name(&state.name, "quant-main");
        }
        m.states.push(MachineState { name: json!(["quant-end"]), trans: Vec::new() });
    }
    let (start, end) = (m.start_state(), m.end_state());
    m.states[start].trans.push(MachineTransition { input: None, output: None, dest: end, weight: one });
    m
}

/// `k+`: one or more repetitions of `k`.
pub fn kleene_plus(k: &Machine, arena: &mut WeightArena) -> Machine {
    let one = arena.one();
    let mut m = k.clone();
    let (start, end) = (m.start_state(), m.end_state());
    m.states[end].trans.push(MachineTransition { input: None, output: None, dest: start, weight: one });
    m
}

/// `k*`: zero or more repetitions of `k`.
pub fn kleene_star(k: &Machine, arena: &mut WeightArena) -> Machine {
    let plus = kleene_plus(k, arena);
    zero_or_one(&plus, arena)
}

/// Run `main` once, then zero or more times `(loop; main)` before
/// terminating after a final `main` pass — i.e. `main (loop main)*`.
pub fn kleene_loop(main: &Machine, loop_m: &Machine, arena: &mut WeightArena) -> Machine {
    let one = arena.one();
    let mut m = main.clone();
    import_defs(&mut m, loop_m);
    for state in m.states.iter_mut() {
        state.name = tag_name(&state.name, "loop-main");
    }
    let shift = main.n_states();
    for state in &loop_m.states {
        let mut shifted = MachineState { name: tag_name(&state.name, "loop-continue"), trans: Vec::new() };
        for t in &state.trans {
            shifted.trans.push(MachineTransition {
                input: t.input.clone(),
                output: t.output.clone(),
                dest: t.dest + shift,
                weight: t.weight,
            });
        }
        m.states.push(shifted);
    }
    m.states.push(MachineState { name: json!(["loop-end"]), trans: Vec::new() });
    let final_state = m.states.len() - 1;
    let main_end = main.end_state();
    let loop_start = shift + loop_m.start_state();
    let loop_end = shift + loop_m.end_state();
    m.states[main_end].trans.push(MachineTransition { input: None, output: None, dest: loop_start, weight: one });
    m.states[main_end].trans.push(MachineTransition {
        input: None,
        output: None,
        dest: final_state,
        weight: one,
    });
    m.states[loop_end].trans.push(MachineTransition {
        input: None,
        output: None,
        dest: main.start_state(),
        weight: one,
    });
    m
}

/// Reverses a machine: state indices flip end-for-end and every transition
/// is re-attached to the mirrored source/destination pair, so a path
/// `start -> ... -> end` in `m` becomes a path `start -> ... -> end` in the
/// result reading the same symbols in the opposite order.
pub fn reverse(m: &Machine) -> Machine {
    let n = m.n_states();
    let mut out = Machine::with_states(n);
    import_defs(&mut out, m);
    for (s, state) in m.states.iter().enumerate() {
        let r = n - 1 - s;
        out.states[r].name = state.name.clone();
        for t in &state.trans {
            let src = n - 1 - t.dest;
            out.states[src].trans.push(MachineTransition {
                input: t.input.clone(),
                output: t.output.clone(),
                dest: r,
                weight: t.weight,
            });
        }
    }
    out
}

/// Swaps the input and output tape on every transition.
pub fn transpose(m: &Machine) -> Machine {
    let mut out = m.clone();
    for state in out.states.iter_mut() {
        for t in state.trans.iter_mut() {
            std::mem::swap(&mut t.input, &mut t.output);
        }
    }
    out
}

fn expand_macro(macro_str: &str, symbol: &str, alphabet_size: usize) -> String {
    macro_str.replace('%', symbol).replace('#', &alphabet_size.to_string())
}

/// Multiplies the weight of every transition consuming input symbol `sym`
/// by a fresh parameter named by expanding `macro_str` (`%` -> `sym`, `#` ->
/// `alphabet_size`), one parameter per distinct symbol.
pub fn weight_inputs(m: &Machine, macro_str: &str, arena: &mut WeightArena) -> Machine {
    let alphabet = m.input_alphabet();
    let n = alphabet.len();
    let mut cache: BTreeMap<Symbol, ExprId> = BTreeMap::new();
    let mut out = m.clone();
    for state in out.states.iter_mut() {
        for t in state.trans.iter_mut() {
            if let Some(sym) = t.input.clone() {
                let w = *cache
                    .entry(sym.clone())
                    .or_insert_with(|| arena.param(expand_macro(macro_str, &sym, n)));
                t.weight = arena.mul(t.weight, w);
            }
        }
    }
    out
}

/// Multiplies the weight of every transition emitting output symbol `sym`
/// by a fresh parameter named by expanding `macro_str` the same way as
/// [`weight_inputs`].
pub fn weight_outputs(m: &Machine, macro_str: &str, arena: &mut WeightArena) -> Machine {
    let alphabet = m.output_alphabet();
    let n = alphabet.len();
    let mut cache: BTreeMap<Symbol, ExprId> = BTreeMap::new();
    let mut out = m.clone();
    for state in out.states.iter_mut() {
        for t in state.trans.iter_mut() {
            if let Some(sym) = t.output.clone() {
                let w = *cache
                    .entry(sym.clone())
                    .or_insert_with(|| arena.param(expand_macro(macro_str, &sym, n)));
                t.weight = arena.mul(t.weight, w);
            }
        }
    }
    out
}

#[inline]
fn comp_state(i: StateIndex, j: StateIndex, j_states: usize) -> StateIndex {
    i * j_states + j
}

/// Transducer composition `first . second`: feeds `first`'s output tape as
/// `second`'s input tape. `second` is converted to a waiting machine first
/// if it is not already one (required by the product construction below).
/// Post-processed through trim/advance-sort/advance/trim, matching the
/// source's pipeline so the result is always ergodic and advancing.
pub fn compose(first: &Machine, second: &Machine, arena: &mut WeightArena) -> Machine {
    tracing::trace!(first_states = first.n_states(), second_states = second.n_states(), "composing machines");
    let second_w = if second.is_waiting() { second.clone() } else { waiting_machine(second, arena) };
    let i_states = first.n_states();
    let j_states = second_w.n_states();
    let total = i_states * j_states;

    let mut keep = vec![false; total];
    let mut to_visit = vec![0usize];
    keep[0] = true;
    let mut kept_states = Vec::new();
    while let Some(c) = to_visit.pop() {
        kept_states.push(c);
        let i = c / j_states;
        let j = c % j_states;
        let msi = &first.states[i];
        let msj = &second_w.states[j];
        let mut dest = Vec::new();
        if msj.waits() || msj.terminates() {
            for it in &msi.trans {
                if it.output.is_none() {
                    dest.push(comp_state(it.dest, j, j_states));
                } else {
                    for jt in &msj.trans {
                        if it.output == jt.input {
                            dest.push(comp_state(it.dest, jt.dest, j_states));
                        }
                    }
                }
            }
        } else {
            for jt in &msj.trans {
                dest.push(comp_state(i, jt.dest, j_states));
            }
        }
        for d in dest {
            if !keep[d] {
                keep[d] = true;
                to_visit.push(d);
            }
        }
    }

    kept_states.sort_unstable();
    let mut comp2kept = vec![0usize; total];
    for (k, &c) in kept_states.iter().enumerate() {
        comp2kept[c] = k;
    }

    let mut m = Machine::with_states(kept_states.len());
    import_defs(&mut m, first);
    import_defs(&mut m, &second_w);

    for (k, &c) in kept_states.iter().enumerate() {
        let i = c / j_states;
        let j = c % j_states;
        m.states[k].name = json!([first.states[i].name, second_w.states[j].name]);
    }

    for (k, &c) in kept_states.iter().enumerate() {
        let i = c / j_states;
        let j = c % j_states;
        let msi = &first.states[i];
        let msj = &second_w.states[j];
        let mut acc = Vec::new();
        if msj.waits() || msj.terminates() {
            for it in &msi.trans {
                if it.output.is_none() {
                    let d = comp_state(it.dest, j, j_states);
                    if keep[d] {
                        acc.push(MachineTransition {
                            input: it.input.clone(),
                            output: None,
                            dest: comp2kept[d],
                            weight: it.weight,
                        });
                    }
                } else {
                    for jt in &msj.trans {
                        if it.output == jt.input {
                            let d = comp_state(it.dest, jt.dest, j_states);
                            if keep[d] {
                                let w = arena.mul(it.weight, jt.weight);
                                acc.push(MachineTransition {
                                    input: it.input.clone(),
                                    output: jt.output.clone(),
                                    dest: comp2kept[d],
                                    weight: w,
                                });
                            }
                        }
                    }
                }
            }
        } else {
            for jt in &msj.trans {
                let d = comp_state(i, jt.dest, j_states);
                if keep[d] {
                    acc.push(MachineTransition {
                        input: None,
                        output: jt.output.clone(),
                        dest: comp2kept[d],
                        weight: jt.weight,
                    });
                }
            }
        }
        m.states[k].trans = accumulate_transitions(&acc, arena);
    }

    let trimmed = trim_ergodic(&m, arena);
    let sorted = crate::topo::advance_sort(&trimmed);
    let advancing = crate::topo::advancing_machine(&sorted, arena);
    trim_ergodic(&advancing, arena)
}

/// Transducer intersection: requires both operands to have an empty output
/// alphabet (i.e. both are acceptors over the same input tape); `second` is
/// converted to a waiting machine first if needed.
pub fn intersect(first: &Machine, second: &Machine, arena: &mut WeightArena) -> Machine {
    let second_w = if second.is_waiting() { second.clone() } else { waiting_machine(second, arena) };
    let (i_states, j_states) = (first.n_states(), second_w.n_states());
    let mut m = Machine::with_states(i_states * j_states);
    import_defs(&mut m, first);
    import_defs(&mut m, &second_w);

    let idx = |i: StateIndex, j: StateIndex| i * j_states + j;
    for i in 0..i_states {
        for j in 0..j_states {
            m.states[idx(i, j)].name = json!([first.states[i].name, second_w.states[j].name]);
        }
    }
    for i in 0..i_states {
        for j in 0..j_states {
            let msi = &first.states[i];
            let msj = &second_w.states[j];
            let mut trans = Vec::new();
            if msj.waits() || msj.terminates() {
                for it in &msi.trans {
                    if it.input.is_none() {
                        trans.push(MachineTransition {
                            input: it.input.clone(),
                            output: None,
                            dest: idx(it.dest, j),
                            weight: it.weight,
                        });
                    } else {
                        for jt in &msj.trans {
                            if it.input == jt.input {
                                let w = arena.mul(it.weight, jt.weight);
                                trans.push(MachineTransition {
                                    input: it.input.clone(),
                                    output: None,
                                    dest: idx(it.dest, jt.dest),
                                    weight: w,
                                });
                            }
                        }
                    }
                }
            } else {
                for jt in &msj.trans {
                    trans.push(MachineTransition { input: None, output: None, dest: idx(i, jt.dest), weight: jt.weight });
                }
            }
            m.states[idx(i, j)].trans = trans;
        }
    }

    let trimmed = trim_ergodic(&m, arena);
    let sorted = crate::topo::advance_sort(&trimmed);
    let advancing = crate::topo::advancing_machine(&sorted, arena);
    trim_ergodic(&advancing, arena)
}

/// Convenience wrapper applying [`crate::topo::process_cycles`] after any
/// combinator call that might leave silent cycles the caller wants
/// resolved up front, e.g. after building a hand-written [`Machine`]
/// outside this module.
pub fn resolve_silent_cycles(m: &Machine, arena: &mut WeightArena, strategy: SilentCycleStrategy) -> Machine {
    crate::topo::process_cycles(m, arena, strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_then_acceptor_concatenate() {
        let mut arena = WeightArena::new();
        let g = generator("g", &["a".to_string(), "b".to_string()], &mut arena);
        let a = acceptor("a", &["x".to_string()], &mut arena);
        let cat = concatenate(&g, &a, &mut arena);
        assert_eq!(cat.n_states(), g.n_states() + a.n_states());
        assert!(cat.validate().is_ok());
    }

    #[test]
    fn zero_or_one_accepts_empty() {
        let mut arena = WeightArena::new();
        let a = acceptor("a", &["x".to_string()], &mut arena);
        let q = zero_or_one(&a, &mut arena);
        let start = q.start_state();
        let end = q.end_state();
        assert!(q.states[start].trans.iter().any(|t| t.dest == end && t.is_silent()));
    }

    #[test]
    fn kleene_star_permits_zero_reps() {
        let mut arena = WeightArena::new();
        let a = acceptor("a", &["x".to_string()], &mut arena);
        let star = kleene_star(&a, &mut arena);
        let start = star.start_state();
        let end = star.end_state();
        assert!(star.states[start].trans.iter().any(|t| t.dest == end));
    }

    #[test]
    fn reverse_is_involution_on_state_count() {
        let mut arena = WeightArena::new();
        let a = acceptor("a", &["x".to_string(), "y".to_string()], &mut arena);
        let r = reverse(&a);
        let rr = reverse(&r);
        assert_eq!(a.n_states(), rr.n_states());
    }

    #[test]
    fn transpose_swaps_tapes() {
        let mut arena = WeightArena::new();
        let g = generator("g", &["a".to_string()], &mut arena);
        let t = transpose(&g);
        assert!(t.states[0].trans[0].input.is_some());
        assert!(t.states[0].trans[0].output.is_none());
    }

    #[test]
    fn compose_matches_single_path_product() {
        let mut arena = WeightArena::new();
        let p = arena.param("p");
        let q = arena.param("q");
        let mut a = Machine::with_states(2);
        a.states[0].trans.push(MachineTransition {
            input: None,
            output: Some("x".into()),
            dest: 1,
            weight: p,
        });
        let mut b = Machine::with_states(2);
        b.states[0].trans.push(MachineTransition {
            input: Some("x".into()),
            output: Some("y".into()),
            dest: 1,
            weight: q,
        });
        let comp = compose(&a, &b, &mut arena);
        assert!(comp.validate().is_ok());
        assert!(comp.n_states() >= 2);
        let has_xy = comp
            .states
            .iter()
            .any(|s| s.trans.iter().any(|t| t.output.as_deref() == Some("y")));
        assert!(has_xy);
    }

    #[test]
    fn weight_inputs_multiplies_per_symbol_param() {
        let mut arena = WeightArena::new();
        let a = acceptor("a", &["x".to_string()], &mut arena);
        let weighted = weight_inputs(&a, "w_%", &mut arena);
        let t = &weighted.states[0].trans[0];
        assert_ne!(t.weight, arena.one());
    }

    #[test]
    fn wild_generator_has_one_state_per_symbol_loop() {
        let mut arena = WeightArena::new();
        let alphabet = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let w = wild_generator("sigma", &alphabet, &mut arena);
        assert_eq!(w.n_states(), 1);
        assert_eq!(w.states[0].trans.len(), alphabet.len());
        assert!(w.states[0].trans.iter().all(|t| t.dest == 0 && t.input.is_none() && t.output.is_some()));
    }

    #[test]
    fn generator_composed_with_wild_recognizer_round_trips() {
        // spec.md §8 scenario 2: generator(seq) => wild_recognizer(seq's alphabet)
        // has log-likelihood 0 over the empty SeqPair.
        let mut arena = WeightArena::new();
        let seq: Vec<Symbol> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let g = generator("g", &seq, &mut arena);
        let r = wild_recognizer("sigma", &seq, &mut arena);
        let comp = compose(&g, &r, &mut arena);
        assert!(comp.validate().is_ok());
        assert!(comp.states.iter().any(|s| s.trans.iter().any(|t| t.input.is_some() && t.output.is_some())));
    }
}
