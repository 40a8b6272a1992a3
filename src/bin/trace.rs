//! Trace Export CLI (spec §4.9, §6)
//!
//! Usage:
//!   trace export --out trace.jsonl --from 10 --to 60 --types FSM_TRANSITION,GUARD_ALERT

use anyhow::Result;
use clap::{Parser, Subcommand};
use radar_core::clock::SystemClock;
use radar_core::config::RuntimeConfig;
use radar_core::event_store::{EventStore, TruthState};
use radar_core::trace_export::{self, TraceExportFilter};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "trace")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export the current event store to a filtered JSONL file.
    Export {
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        from: Option<f64>,
        #[arg(long)]
        to: Option<f64>,
        /// Comma-separated event_type allowlist.
        #[arg(long)]
        types: Option<String>,
        /// Comma-separated subsystem allowlist.
        #[arg(long)]
        subsystems: Option<String>,
        /// Comma-separated truth_state allowlist (OK, NO_DATA, FALLBACK).
        #[arg(long)]
        truth: Option<String>,
        #[arg(long)]
        max_lines: Option<usize>,
        /// Comma-separated TYPE=K pairs, keep 1-in-K events of that type.
        #[arg(long)]
        sample: Option<String>,
    },
}

fn parse_truth_state(s: &str) -> Option<TruthState> {
    match s {
        "OK" => Some(TruthState::Ok),
        "NO_DATA" => Some(TruthState::NoData),
        "FALLBACK" => Some(TruthState::Fallback),
        _ => None,
    }
}

fn parse_sample_rates(s: &str) -> HashMap<String, u32> {
    s.split(',')
        .filter_map(|pair| {
            let (ty, k) = pair.split_once('=')?;
            Some((ty.to_string(), k.parse().ok()?))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RuntimeConfig::load()?;
    let clock: Arc<dyn radar_core::clock::Clock> = Arc::new(SystemClock::new());
    let event_store = Arc::new(EventStore::open(
        &config.event_store,
        config.strict_mode,
        clock.clone(),
        "trace-cli",
    )?);

    match args.command {
        Command::Export { out, from, to, types, subsystems, truth, max_lines, sample } => {
            let filter = TraceExportFilter {
                from_ts: from,
                to_ts: to,
                types: types.map(|t| t.split(',').map(str::to_string).collect()),
                subsystems: subsystems.map(|s| s.split(',').map(str::to_string).collect()),
                truth_states: truth.map(|t| t.split(',').filter_map(parse_truth_state).collect()),
                max_lines,
                sample_rates: sample.map(|s| parse_sample_rates(&s)).unwrap_or_default(),
            };
            let handle = trace_export::start_export(event_store.clone(), clock, out, filter);
            let lines = handle.await??;
            println!("{}", serde_json::json!({"lines_written": lines}));
        }
    }
    Ok(())
}
