//! Health CLI (spec §6)
//!
//! Usage:
//!   health-cli --json

use anyhow::Result;
use clap::Parser;
use radar_core::clock::SystemClock;
use radar_core::config::RuntimeConfig;
use radar_core::event_store::EventStore;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "health-cli")]
struct Args {
    /// Print machine-readable JSON instead of a human-readable summary.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = RuntimeConfig::load()?;
    let clock: Arc<dyn radar_core::clock::Clock> = Arc::new(SystemClock::new());
    let event_store = EventStore::open(&config.event_store, config.strict_mode, clock, "health-cli")?;

    let recent_health = event_store.filter(Some("HEALTH"), None, None);
    let last_by_metric: std::collections::HashMap<String, &radar_core::event_store::SystemEvent> =
        recent_health.iter().rev().fold(std::collections::HashMap::new(), |mut map, event| {
            if let Some(metric_id) = event.payload.get("metric_id").and_then(|v| v.as_str()) {
                map.entry(metric_id.to_string()).or_insert(event);
            }
            map
        });

    if args.json {
        let snapshot: serde_json::Value = serde_json::json!(last_by_metric
            .iter()
            .map(|(k, v)| (k.clone(), v.payload.clone()))
            .collect::<std::collections::HashMap<_, _>>());
        println!("{snapshot}");
    } else {
        println!("=== Radar Core Health ===");
        for (metric_id, event) in &last_by_metric {
            println!("{metric_id}: {} ({})", event.event_type, event.reason);
        }
        if last_by_metric.is_empty() {
            println!("no health samples recorded yet");
        }
    }
    Ok(())
}
