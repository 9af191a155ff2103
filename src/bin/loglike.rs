//! Minimal CLI scorer: reads a machine document, a flat parameter
//! document, and one or more sequence pairs, and prints each pair's
//! log-likelihood (and their sum) under the bound machine.
//!
//! Usage:
//!   wfst-loglike --machine machine.json --params params.json --data pairs.json

#![forbid(unsafe_code)]
#![allow(unused_mut)]

use std::{env, fs};

use wfstk::envelope::Envelope;
use wfstk::evaluated::EvaluatedMachine;
use wfstk::forward::log_likelihood;
use wfstk::json::{machine_from_json, params_from_json, seq_pair_from_json};
use wfstk::params::ParamDefs;
use wfstk::weight::WeightArena;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let machine_path = parse_flag(&args, "--machine")
        .ok_or_else(|| anyhow::anyhow!("missing --machine <path>"))?;
    let params_path = parse_flag(&args, "--params")
        .ok_or_else(|| anyhow::anyhow!("missing --params <path>"))?;
    let data_path = parse_flag(&args, "--data")
        .ok_or_else(|| anyhow::anyhow!("missing --data <path>"))?;

    eprintln!("loading machine from {machine_path}");
    let mut arena = WeightArena::new();
    let machine_json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&machine_path)?)?;
    let machine = machine_from_json(&machine_json, &mut arena)?;

    eprintln!("loading parameters from {params_path}");
    let params_json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&params_path)?)?;
    let values = params_from_json(&params_json)?;
    let mut env = ParamDefs::new();
    for (name, v) in &values {
        env.insert(name.clone(), arena.double_const(*v));
    }

    let em = EvaluatedMachine::build(&machine, &env, &arena)?;

    eprintln!("loading sequence pairs from {data_path}");
    let data_json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&data_path)?)?;
    let pairs = data_json
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("--data must be a JSON array of sequence-pair documents"))?;

    let mut total = 0.0;
    let mut scores = Vec::with_capacity(pairs.len());
    for (i, pj) in pairs.iter().enumerate() {
        let seq = seq_pair_from_json(pj)?;
        let envelope = Envelope::full(seq.input.len(), seq.output.len());
        let ll = log_likelihood(&em, &seq, &envelope)?;
        eprintln!("  example {i}: log-likelihood {ll:.6}");
        total += ll;
        scores.push(ll);
    }

    let doc = serde_json::json!({ "log_likelihoods": scores, "total": total });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
