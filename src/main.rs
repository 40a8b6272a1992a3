//! Process entrypoint (spec §4.12): owns process-level concerns the library never touches —
//! `.env` loading, `tracing_subscriber` init, and the live tick loop. Library code only ever
//! appends to an already-constructed `EventStore`.

use radar_core::clock::SystemClock;
use radar_core::config::RuntimeConfig;
use radar_core::event_store::EventStore;
use radar_core::guard::GuardTable;
use radar_core::pipeline::{ExternalFsmInputs, RadarPipeline};
use radar_core::render::RenderPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = RuntimeConfig::load()?;
    let clock: Arc<dyn radar_core::clock::Clock> = Arc::new(SystemClock::new());
    let session_id = format!("session-{}", clock.now());
    let event_store = Arc::new(EventStore::open(
        &config.event_store,
        config.strict_mode,
        clock.clone(),
        session_id,
    )?);

    let guard_table = GuardTable::default_table();
    let render_policy = RenderPolicy::default_policy();
    let frame_budget_ms: f64 = std::env::var("QIKI_FRAME_BUDGET_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(33.3);

    let mut pipeline = RadarPipeline::new(
        &config,
        clock,
        event_store.clone(),
        guard_table,
        render_policy,
        None,
        frame_budget_ms,
        None,
    );

    tracing::info!("qiki-radar core starting");
    let tick_interval = Duration::from_millis(frame_budget_ms.max(1.0) as u64);
    let fsm_inputs = ExternalFsmInputs {
        bios_ok: true,
        sensors_ok: true,
        provider_ok: true,
        docking_engaged: false,
        command: None,
    };

    loop {
        let report = pipeline.tick(&[], &HashMap::new(), fsm_inputs.clone());
        tracing::debug!(ts = report.ts, fused = report.fused_count, "tick complete");
        tokio::time::sleep(tick_interval).await;
    }
}
