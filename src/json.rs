//! Canonical JSON I/O for machines, parameters, constraints, and sequence
//! pairs — the on-disk formats from spec.md §6.
//!
//! Weight-expression encoding itself is [`WeightArena::to_json`]/
//! [`WeightArena::from_json`] (already shared by `defs`/`trans[].weight`);
//! this module adds the surrounding machine/state/transition envelope and
//! the flat parameter/constraints documents.

use std::collections::HashMap;

use serde_json::{json, Map, Value as Json};

use crate::envelope::{NamedSeq, SeqPair};
use crate::error::{Error, Result};
use crate::machine::{Machine, MachineState, MachineTransition, StateIndex};
use crate::params::{Constraints, ParamDefs};
use crate::weight::WeightArena;

/// Serialises `machine` to the canonical machine JSON document, using
/// `arena` to render every weight expression (memoised via `defs` so any
/// subexpression shared by more than one transition is written once).
pub fn machine_to_json(machine: &Machine, arena: &WeightArena) -> Json {
    let mut roots: Vec<_> = machine.states.iter().flat_map(|s| s.trans.iter().map(|t| t.weight)).collect();
    roots.extend(machine.defs.iter().map(|(_, e)| e));
    let (memos, memo_defs) = arena.memoize(&roots);

    let states: Vec<Json> = machine
        .states
        .iter()
        .enumerate()
        .map(|(n, state)| {
            let trans: Vec<Json> = state
                .trans
                .iter()
                .map(|t| {
                    let mut obj = Map::new();
                    obj.insert("to".into(), json!(t.dest));
                    if let Some(input) = &t.input {
                        obj.insert("in".into(), json!(input));
                    }
                    if let Some(output) = &t.output {
                        obj.insert("out".into(), json!(output));
                    }
                    if !arena.is_one(t.weight) {
                        obj.insert("weight".into(), arena.to_json_memo(t.weight, &memos));
                    }
                    Json::Object(obj)
                })
                .collect();
            json!({ "n": n, "id": state.name.clone(), "trans": trans })
        })
        .collect();

    let mut defs_obj = Map::new();
    for (name, id) in memo_defs {
        defs_obj.insert(name, arena.to_json_memo(id, &memos));
    }
    for (name, id) in machine.defs.iter() {
        defs_obj.insert(name.to_string(), arena.to_json_memo(id, &memos));
    }

    let mut doc = Map::new();
    doc.insert("state".into(), Json::Array(states));
    if !defs_obj.is_empty() {
        doc.insert("defs".into(), Json::Object(defs_obj));
    }
    let cons = constraints_to_json(&machine.cons);
    if cons != json!({}) {
        doc.insert("cons".into(), cons);
    }
    Json::Object(doc)
}

/// Parses a machine from its canonical JSON document, interning every
/// weight expression into `arena`. State `id`s are resolved to indices
/// either via an explicit `"n"` field or by document order; transition
/// `"to"` targets are resolved the same way, falling back to treating a
/// non-integer `to` as an `id` lookup.
pub fn machine_from_json(j: &Json, arena: &mut WeightArena) -> Result<Machine> {
    let obj = j.as_object().ok_or_else(|| Error::Schema("machine document must be a JSON object".into()))?;
    let states_json = obj
        .get("state")
        .and_then(Json::as_array)
        .ok_or_else(|| Error::Schema("machine document missing `state` array".into()))?;

    let defs = match obj.get("defs") {
        Some(Json::Object(map)) => {
            let mut defs = ParamDefs::new();
            for (name, expr_json) in map {
                let expr = arena.from_json(expr_json, None)?;
                defs.insert(name.clone(), expr);
            }
            defs
        }
        _ => ParamDefs::new(),
    };

    let mut id_to_index: HashMap<String, StateIndex> = HashMap::new();
    for (i, sj) in states_json.iter().enumerate() {
        let n = sj.get("n").and_then(Json::as_u64).map(|v| v as StateIndex).unwrap_or(i);
        if let Some(id) = sj.get("id") {
            id_to_index.insert(canonical_id_key(id), n);
        }
    }
    let resolve = |target: &Json, id_to_index: &HashMap<String, StateIndex>| -> Result<StateIndex> {
        if let Some(n) = target.as_u64() {
            return Ok(n as StateIndex);
        }
        id_to_index
            .get(&canonical_id_key(target))
            .copied()
            .ok_or_else(|| Error::Reference(format!("unresolved state reference {target}")))
    };

    let mut states = vec![MachineState::default(); states_json.len()];
    for (i, sj) in states_json.iter().enumerate() {
        let n = sj.get("n").and_then(Json::as_u64).map(|v| v as StateIndex).unwrap_or(i);
        if n >= states.len() {
            return Err(Error::OutOfRange { index: n, len: states.len() });
        }
        states[n].name = sj.get("id").cloned().unwrap_or(Json::Null);

        let trans_json = sj.get("trans").and_then(Json::as_array).cloned().unwrap_or_default();
        for tj in &trans_json {
            let to = tj.get("to").ok_or_else(|| Error::Schema("transition missing `to`".into()))?;
            let dest = resolve(to, &id_to_index)?;
            let input = tj.get("in").and_then(Json::as_str).map(str::to_string);
            let output = tj.get("out").and_then(Json::as_str).map(str::to_string);
            let weight = match tj.get("weight") {
                Some(w) => arena.from_json(w, Some(&defs))?,
                None => arena.one(),
            };
            states[n].trans.push(MachineTransition { input, output, dest, weight });
        }
    }

    let cons = match obj.get("cons") {
        Some(cj) => constraints_from_json(cj)?,
        None => Constraints::new(),
    };

    Ok(Machine { states, defs, cons })
}

fn canonical_id_key(id: &Json) -> String {
    serde_json::to_string(id).unwrap_or_default()
}

/// Flat parameter-name -> numeric-value document.
pub fn params_to_json(values: &HashMap<String, f64>) -> Json {
    let map: Map<String, Json> = values.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
    Json::Object(map)
}

pub fn params_from_json(j: &Json) -> Result<HashMap<String, f64>> {
    let obj = j.as_object().ok_or_else(|| Error::Schema("parameters document must be a JSON object".into()))?;
    obj.iter()
        .map(|(k, v)| {
            v.as_f64()
                .map(|f| (k.clone(), f))
                .ok_or_else(|| Error::Schema(format!("parameter `{k}` is not numeric")))
        })
        .collect()
}

/// `{ "norm": [[...], ...], "rate": [...] }`.
pub fn constraints_to_json(cons: &Constraints) -> Json {
    let mut obj = Map::new();
    if !cons.norm.is_empty() {
        obj.insert("norm".into(), json!(cons.norm));
    }
    if !cons.rate.is_empty() {
        obj.insert("rate".into(), json!(cons.rate));
    }
    Json::Object(obj)
}

pub fn constraints_from_json(j: &Json) -> Result<Constraints> {
    let obj = j.as_object().ok_or_else(|| Error::Schema("constraints document must be a JSON object".into()))?;
    let norm = match obj.get("norm") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| Error::Schema(format!("invalid `norm` constraint: {e}")))?,
        None => Vec::new(),
    };
    let rate = match obj.get("rate") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| Error::Schema(format!("invalid `rate` constraint: {e}")))?,
        None => Vec::new(),
    };
    Ok(Constraints { norm, rate })
}

/// A sequence-pair document: `{ "input": {"name":..,"seq":[...]}, "output":
/// {...} }` (the alignment, if present, is not part of the external
/// format — it's derived via [`crate::envelope::Envelope::from_alignment`]
/// when a caller already has one, not serialised here).
pub fn seq_pair_to_json(seq: &SeqPair) -> Json {
    json!({
        "input": { "name": seq.input.name, "seq": seq.input.seq },
        "output": { "name": seq.output.name, "seq": seq.output.seq },
    })
}

pub fn seq_pair_from_json(j: &Json) -> Result<SeqPair> {
    let obj = j.as_object().ok_or_else(|| Error::Schema("sequence-pair document must be a JSON object".into()))?;
    let parse_named = |key: &str| -> Result<NamedSeq> {
        let nj = obj.get(key).ok_or_else(|| Error::Schema(format!("sequence-pair document missing `{key}`")))?;
        let name = nj.get("name").and_then(Json::as_str).unwrap_or(key).to_string();
        let seq: Vec<String> = nj
            .get("seq")
            .and_then(Json::as_array)
            .ok_or_else(|| Error::Schema(format!("`{key}.seq` must be an array")))?
            .iter()
            .map(|s| s.as_str().map(str::to_string).ok_or_else(|| Error::Schema("sequence entries must be strings".into())))
            .collect::<Result<_>>()?;
        Ok(NamedSeq::new(name, seq))
    };
    Ok(SeqPair::new(parse_named("input")?, parse_named("output")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight::WeightArena;

    #[test]
    fn machine_roundtrips_through_json() {
        let mut arena = WeightArena::new();
        let w = arena.double_const(0.5);
        let mut m = Machine::with_states(2);
        m.states[0].trans.push(MachineTransition {
            input: Some("a".into()),
            output: Some("x".into()),
            dest: 1,
            weight: w,
        });
        let doc = machine_to_json(&m, &arena);
        let parsed = machine_from_json(&doc, &mut arena).unwrap();
        assert_eq!(parsed.n_states(), 2);
        assert_eq!(parsed.states[0].trans.len(), 1);
        assert_eq!(parsed.states[0].trans[0].dest, 1);
        let v = arena.eval(parsed.states[0].trans[0].weight, &ParamDefs::new()).unwrap();
        assert!((v - 0.5).abs() < 1e-12);
    }

    #[test]
    fn constraints_roundtrip() {
        let cons = Constraints { norm: vec![vec!["a".into(), "b".into()]], rate: vec!["r".into()] };
        let j = constraints_to_json(&cons);
        let back = constraints_from_json(&j).unwrap();
        assert_eq!(cons, back);
    }

    #[test]
    fn params_roundtrip() {
        let mut values = HashMap::new();
        values.insert("a".to_string(), 0.25);
        let j = params_to_json(&values);
        let back = params_from_json(&j).unwrap();
        assert_eq!(values, back);
    }

    #[test]
    fn seq_pair_roundtrips() {
        let seq = SeqPair::new(NamedSeq::new("in", vec!["a".into()]), NamedSeq::new("out", vec!["x".into()]));
        let j = seq_pair_to_json(&seq);
        let back = seq_pair_from_json(&j).unwrap();
        assert_eq!(seq, back);
    }
}
