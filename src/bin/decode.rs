//! Minimal CLI decoder: reads a machine document, a flat parameter
//! document, and a target output sequence, and searches for the
//! highest-probability input sequence that produces it.
//!
//! Usage:
//!   wfst-decode --machine machine.json --params params.json --target a,b,c [--method ctc|beam|anneal]
//!
//! `--target` is a comma-separated list of output symbols. `--method`
//! defaults to `ctc`; `beam` additionally honours `--beam-width` (default
//! 8) and `--max-steps` (default matches the target length doubled);
//! `anneal` honours `--seed`, `--burn-in`, `--iters`.

#![forbid(unsafe_code)]
#![allow(unused_mut)]

use std::{env, fs};

use wfstk::anneal::anneal_decode;
use wfstk::beam::beam_search;
use wfstk::decode::decode_ctc;
use wfstk::evaluated::EvaluatedMachine;
use wfstk::json::{machine_from_json, params_from_json};
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
    let target_raw = parse_flag(&args, "--target")
        .ok_or_else(|| anyhow::anyhow!("missing --target <a,b,c>"))?;
    let method = parse_flag(&args, "--method").unwrap_or_else(|| "ctc".to_string());

    let target: Vec<String> = target_raw.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
    if target.is_empty() {
        anyhow::bail!("--target must name at least one output symbol");
    }

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

    eprintln!("decoding {} output symbol(s) via `{method}`...", target.len());
    let (log_score, decoded) = match method.as_str() {
        "ctc" => decode_ctc(&em, &target)?,
        "beam" => {
            let beam_width: usize = parse_flag(&args, "--beam-width").and_then(|s| s.parse().ok()).unwrap_or(8);
            let max_steps: usize = parse_flag(&args, "--max-steps").and_then(|s| s.parse().ok()).unwrap_or(target.len() * 2);
            beam_search(&em, &target, beam_width, max_steps)?
        }
        "anneal" => {
            let seed: u64 = parse_flag(&args, "--seed").and_then(|s| s.parse().ok()).unwrap_or(0);
            let burn_in: usize = parse_flag(&args, "--burn-in").and_then(|s| s.parse().ok()).unwrap_or(200);
            let iters: usize = parse_flag(&args, "--iters").and_then(|s| s.parse().ok()).unwrap_or(2000);
            anneal_decode(&em, &target, seed, burn_in, iters)?
        }
        other => anyhow::bail!("unknown --method `{other}` (expected ctc, beam, or anneal)"),
    };

    eprintln!("log-score: {log_score:.6}");
    let doc = serde_json::json!({ "input": decoded, "log_score": log_score });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
