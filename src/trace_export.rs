//! Filtered trace export and replay (spec §4.9), grounded in `event_store::sqlite`'s writer-task
//! shape (one background task, caller returns immediately) and in
//! `original_source/.../test_radar_fusion.py`'s fusion-determinism assertions for the golden
//! replay contract (spec §8 property 6).

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::event_store::{EventStore, SystemEvent, TruthState, WireEvent};
use crate::fusion::{FusedTrack, FusionEngine};
use crate::track_store::{Observation, TrackStore, TrackStoreConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Filters applied to a trace export (spec §6 `trace export` CLI flags).
#[derive(Debug, Clone, Default)]
pub struct TraceExportFilter {
    pub from_ts: Option<f64>,
    pub to_ts: Option<f64>,
    pub types: Option<Vec<String>>,
    pub subsystems: Option<Vec<String>>,
    pub truth_states: Option<Vec<TruthState>>,
    pub max_lines: Option<usize>,
    /// Per-event-type sample rate: keep 1 in every K events of that type (1 = keep all).
    pub sample_rates: HashMap<String, u32>,
}

impl TraceExportFilter {
    fn matches(&self, event: &SystemEvent) -> bool {
        if let Some(from) = self.from_ts {
            if event.ts < from {
                return false;
            }
        }
        if let Some(to) = self.to_ts {
            if event.ts > to {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(subsystems) = &self.subsystems {
            if !subsystems.iter().any(|s| s == &event.subsystem) {
                return false;
            }
        }
        if let Some(truth_states) = &self.truth_states {
            if !truth_states.contains(&event.truth_state) {
                return false;
            }
        }
        true
    }

    fn apply(&self, events: Vec<SystemEvent>) -> Vec<SystemEvent> {
        let mut counters: HashMap<String, u32> = HashMap::new();
        let mut out: Vec<SystemEvent> = events
            .into_iter()
            .filter(|e| self.matches(e))
            .filter(|e| {
                let rate = self.sample_rates.get(&e.event_type).copied().unwrap_or(1).max(1);
                let count = counters.entry(e.event_type.clone()).or_insert(0);
                let keep = *count % rate == 0;
                *count += 1;
                keep
            })
            .collect();
        if let Some(max_lines) = self.max_lines {
            out.truncate(max_lines);
        }
        out
    }
}

/// Writes exactly the eight frozen wire keys per line (spec §6), never the internal `event_id`.
fn write_jsonl(path: &Path, events: &[SystemEvent]) -> CoreResult<usize> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)
        .map_err(|e| CoreError::WriterIo(format!("create {path:?}: {e}")))?;
    for event in events {
        let wire = WireEvent::from(event);
        let line = serde_json::to_string(&wire).map_err(|e| CoreError::InvalidPayload(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| CoreError::WriterIo(e.to_string()))?;
    }
    Ok(events.len())
}

fn run_export(store: &EventStore, out_path: &Path, filter: &TraceExportFilter) -> CoreResult<usize> {
    let snapshot = store.snapshot();
    let filtered = filter.apply(snapshot);
    write_jsonl(out_path, &filtered)
}

/// Starts a background export task and returns immediately after recording
/// `TRACE_EXPORT_STARTED`; the task itself records `TRACE_EXPORT_FINISHED`/`TRACE_EXPORT_FAILED`
/// on completion (spec §4.9, §5 "trace export runs as a separate task").
pub fn start_export(
    store: Arc<EventStore>,
    clock: Arc<dyn Clock>,
    out_path: PathBuf,
    filter: TraceExportFilter,
) -> tokio::task::JoinHandle<CoreResult<usize>> {
    let start_ts = clock.now();
    let _ = store.append(
        "TRACE",
        "TRACE_EXPORT_STARTED",
        serde_json::json!({"out": out_path.to_string_lossy()}),
        TruthState::Ok,
        "EXPORT_REQUESTED",
        Some(start_ts),
    );

    tokio::spawn(async move {
        let result = run_export(&store, &out_path, &filter);
        let now_ts = clock.now();
        match &result {
            Ok(n) => {
                let _ = store.append(
                    "TRACE",
                    "TRACE_EXPORT_FINISHED",
                    serde_json::json!({"lines": n, "out": out_path.to_string_lossy()}),
                    TruthState::Ok,
                    "EXPORT_COMPLETE",
                    Some(now_ts),
                );
            }
            Err(err) => {
                let _ = store.append(
                    "TRACE",
                    "TRACE_EXPORT_FAILED",
                    serde_json::json!({"error": err.to_string()}),
                    TruthState::NoData,
                    "EXPORT_FAILED",
                    Some(now_ts),
                );
            }
        }
        result
    })
}

/// A loaded, time-sorted replay trace (spec §4.9). Supports two uses: raw event reinjection
/// (pipeline replay mode, §4.7 step 2) and observation extraction for the golden fusion-replay
/// regression contract (§8 property 6).
pub struct ReplaySource {
    events: Vec<SystemEvent>,
    cursor: usize,
}

impl ReplaySource {
    /// Loads a wire-format trace (eight keys per line, no `event_id` on disk). Each line is
    /// assigned a synthetic `event_id` from its position in the file so ties on `ts` still break
    /// deterministically in original (already-chronological) export order; downstream replay
    /// consumers (`observation_from_event`) never read `event_id` itself.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::WriterIo(format!("read {path:?}: {e}")))?;
        let mut events: Vec<SystemEvent> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, l)| {
                let wire = serde_json::from_str::<WireEvent>(l)
                    .map_err(|e| CoreError::InvalidPayload(format!("malformed trace line: {e}")))?;
                Ok(SystemEvent {
                    schema_version: wire.schema_version,
                    event_id: i as u64,
                    ts: wire.ts,
                    subsystem: wire.subsystem,
                    event_type: wire.event_type,
                    truth_state: wire.truth_state,
                    reason: wire.reason,
                    payload: wire.payload,
                    session_id: wire.session_id,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        events.sort_by(|a, b| a.ts.partial_cmp(&b.ts).unwrap().then(a.event_id.cmp(&b.event_id)));
        Ok(Self { events, cursor: 0 })
    }

    /// Returns events with `ts <= at_ts` not yet drained, advancing the cursor past them.
    pub fn due_before(&mut self, at_ts: f64) -> Vec<SystemEvent> {
        let start = self.cursor;
        let mut end = start;
        while end < self.events.len() && self.events[end].ts <= at_ts {
            end += 1;
        }
        self.cursor = end;
        self.events[start..end].to_vec()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.events.len()
    }

    pub fn next_ts(&self) -> Option<f64> {
        self.events.get(self.cursor).map(|e| e.ts)
    }
}

pub(crate) fn observation_from_event(event: &SystemEvent) -> Option<Observation> {
    if event.event_type != "SOURCE_TRACK_UPDATED" {
        return None;
    }
    let p = &event.payload;
    let source_id = p.get("source_id")?.as_str()?.to_string();
    let source_track_id = p.get("source_track_id")?.as_str()?.to_string();
    let pos = p.get("pos_xy")?.as_array()?;
    let vel = p.get("vel_xy")?.as_array()?;
    let quality = p.get("quality")?.as_f64()?;
    Some(Observation::new(
        source_id,
        event.ts,
        source_track_id,
        (pos.first()?.as_f64()?, pos.get(1)?.as_f64()?),
        (vel.first()?.as_f64()?, vel.get(1)?.as_f64()?),
        quality,
    ))
}

/// Drives a fresh `TrackStore`/`FusionEngine` pair from a captured trace's `SOURCE_TRACK_UPDATED`
/// events, frame by frame, and returns the resulting `FusedTrack` sequence. Used to verify the
/// golden determinism property: replaying a trace must reproduce the same fused-track sequence
/// the original run produced (spec §4.9, §8 property 6).
pub fn replay_fused_sequence(
    events: &[SystemEvent],
    track_cfg: TrackStoreConfig,
    fusion_cfg: crate::config::FusionConfig,
    clock: Arc<dyn Clock>,
) -> Vec<Vec<FusedTrack>> {
    let mut by_ts: Vec<(f64, Vec<Observation>)> = Vec::new();
    for event in events {
        if let Some(obs) = observation_from_event(event) {
            match by_ts.last_mut() {
                Some((ts, obs_list)) if *ts == obs.ts_event => obs_list.push(obs),
                _ => by_ts.push((obs.ts_event, vec![obs])),
            }
        }
    }

    let mut track_store = TrackStore::new(track_cfg);
    let mut fusion = FusionEngine::new(fusion_cfg, clock.clone());
    let mut frames = Vec::with_capacity(by_ts.len());

    for (ts, observations) in by_ts {
        track_store.ingest(&observations, None);
        let refs: Vec<&crate::track_store::SourceTrack> = track_store.tracks().collect();
        let fused = fusion.fuse(&refs, None);
        let _ = ts;
        frames.push(fused);
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::event_store::envelope::SCHEMA_VERSION;

    fn event(ts: f64, event_type: &str, subsystem: &str, truth_state: TruthState) -> SystemEvent {
        SystemEvent {
            schema_version: SCHEMA_VERSION,
            event_id: (ts * 10.0) as u64,
            ts,
            subsystem: subsystem.into(),
            event_type: event_type.into(),
            truth_state,
            reason: "TEST".into(),
            payload: serde_json::json!({}),
            session_id: "t".into(),
        }
    }

    #[test]
    fn filter_respects_time_window_and_types() {
        let filter = TraceExportFilter {
            from_ts: Some(5.0),
            to_ts: Some(15.0),
            types: Some(vec!["FSM_TRANSITION".into()]),
            ..Default::default()
        };
        let events = vec![
            event(1.0, "FSM_TRANSITION", "FSM", TruthState::Ok),
            event(10.0, "FSM_TRANSITION", "FSM", TruthState::Ok),
            event(10.0, "HEALTH_WARN", "HEALTH", TruthState::Ok),
            event(20.0, "FSM_TRANSITION", "FSM", TruthState::Ok),
        ];
        let out = filter.apply(events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ts, 10.0);
    }

    #[test]
    fn sample_rate_keeps_one_in_k() {
        let mut rates = HashMap::new();
        rates.insert("HEALTH_WARN".to_string(), 2);
        let filter = TraceExportFilter { sample_rates: rates, ..Default::default() };
        let events: Vec<SystemEvent> = (0..6).map(|i| event(i as f64, "HEALTH_WARN", "HEALTH", TruthState::Ok)).collect();
        let out = filter.apply(events);
        assert_eq!(out.len(), 3, "every other event kept at sample rate 2");
    }

    #[test]
    fn replay_source_drains_events_due_at_or_before_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let events = vec![event(0.0, "A", "S", TruthState::Ok), event(1.0, "B", "S", TruthState::Ok), event(5.0, "C", "S", TruthState::Ok)];
        let lines: Vec<String> = events.iter().map(|e| serde_json::to_string(e).unwrap()).collect();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let mut replay = ReplaySource::load(&path).unwrap();
        let due = replay.due_before(1.0);
        assert_eq!(due.len(), 2);
        assert!(!replay.is_exhausted());
        let rest = replay.due_before(5.0);
        assert_eq!(rest.len(), 1);
        assert!(replay.is_exhausted());
    }

    #[test]
    fn fused_sequence_is_deterministic_across_two_replays_of_same_trace() {
        let store = EventStore::memory(100, Arc::new(SystemClock::new()), "t");
        for (ts, src, id, x, y) in [
            (10.0, "radar-a", "1", 0.0, 0.0),
            (10.0, "radar-b", "2", 1.0, 1.0),
            (11.0, "radar-a", "1", 0.5, 0.5),
            (11.0, "radar-b", "2", 1.5, 1.5),
        ] {
            store.append(
                "TRACKS",
                "SOURCE_TRACK_UPDATED",
                serde_json::json!({
                    "source_id": src, "source_track_id": id,
                    "pos_xy": [x, y], "vel_xy": [0.0, 0.0], "quality": 0.9,
                }),
                TruthState::Ok,
                "OBSERVATION_ASSOCIATED",
                Some(ts),
            )
            .unwrap();
        }
        let events = store.snapshot();

        let fusion_cfg = crate::config::FusionConfig {
            enabled: true,
            gate_dist_m: 10.0,
            gate_vel_mps: 5.0,
            min_support: 1,
            max_age_s: 100.0,
            conflict_dist_m: 50.0,
            confirm_frames: 1,
            cooldown_s: 0.0,
        };
        let seq1 = replay_fused_sequence(&events, TrackStoreConfig::default(), fusion_cfg.clone(), Arc::new(SystemClock::new()));
        let seq2 = replay_fused_sequence(&events, TrackStoreConfig::default(), fusion_cfg, Arc::new(SystemClock::new()));

        assert_eq!(seq1.len(), seq2.len());
        for (f1, f2) in seq1.iter().zip(seq2.iter()) {
            let ids1: Vec<&str> = f1.iter().map(|t| t.fused_id.as_str()).collect();
            let ids2: Vec<&str> = f2.iter().map(|t| t.fused_id.as_str()).collect();
            assert_eq!(ids1, ids2);
        }
    }
}
