//! Minimal CLI trainer: reads a machine document, a flat initial-parameter
//! document, and a list of (input, output) sequence pairs, runs EM to
//! convergence, and writes the fitted parameter document.
//!
//! Usage:
//!   wfst-train --machine machine.json --params init.json --data pairs.json [--out fitted.json]
//!
//! `pairs.json` is a JSON array of sequence-pair documents (spec.md §6); no
//! alignment is required, so every example trains against a full envelope.

#![forbid(unsafe_code)]
#![allow(unused_mut)]

use std::{env, fs};

use wfstk::envelope::Envelope;
use wfstk::fitter::fit_em;
use wfstk::json::{machine_from_json, params_from_json, params_to_json, seq_pair_from_json};
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
    let out_path = parse_flag(&args, "--out").unwrap_or_else(|| "fitted.json".to_string());

    eprintln!("loading machine from {machine_path}");
    let mut arena = WeightArena::new();
    let machine_json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&machine_path)?)?;
    let machine = machine_from_json(&machine_json, &mut arena)?;
    eprintln!("  {} state(s)", machine.n_states());

    eprintln!("loading initial parameters from {params_path}");
    let params_json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&params_path)?)?;
    let initial = params_from_json(&params_json)?;
    eprintln!("  {} parameter(s)", initial.len());

    eprintln!("loading training pairs from {data_path}");
    let data_json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&data_path)?)?;
    let pairs = data_json
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("--data must be a JSON array of sequence-pair documents"))?;
    let mut training = Vec::with_capacity(pairs.len());
    for pj in pairs {
        let seq = seq_pair_from_json(pj)?;
        let envelope = Envelope::full(seq.input.len(), seq.output.len());
        training.push((seq, envelope));
    }
    eprintln!("  {} example(s)", training.len());

    eprintln!("running EM...");
    let (fitted, log_like) = fit_em(&mut arena, &machine, initial, &training)?;
    eprintln!("converged at log-likelihood {log_like:.6}");

    let doc = params_to_json(&fitted);
    fs::write(&out_path, serde_json::to_string_pretty(&doc)?)?;
    eprintln!("wrote fitted parameters to {out_path}");
    Ok(())
}
