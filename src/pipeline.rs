//! Radar Pipeline (spec §4.7): the single-threaded per-tick orchestrator tying the Track Store,
//! Fusion Engine, Guard Table/Cadence, Ship FSM, Health Monitor, and Adaptive Render Policy
//! together. Grounded in `original_source/.../faststream_bridge`'s single tick-loop driver and in
//! `event_store::sqlite`'s "never block the producer" stance: a tick never waits on IO.

use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::event_store::{EventStore, TruthState};
use crate::fsm::{FsmCommand, ShipFsm, TickInputs, TransitionRecord};
use crate::fusion::FusionEngine;
use crate::guard::table::{FriendFoe, RadarTrack, TransponderMode};
use crate::guard::{GuardTable, RadarGuardCadence};
use crate::health::HealthMonitor;
use crate::metrics::FrameMetrics;
use crate::render::{self, AdaptiveDegradePolicy, RenderPlan, RenderPolicy};
use crate::track_store::{Observation, TrackStore};
use crate::trace_export::{self, ReplaySource};
use std::collections::HashMap;
use std::sync::Arc;

/// External classification signal for one fused track, supplied by the `situational_analysis`
/// plugin slot. Absence means the guard layer sees `FriendFoe::Unknown` / transponder off, never
/// a fabricated friendly default (spec §3 truth-or-absence).
#[derive(Debug, Clone, Copy)]
pub struct ClassificationInput {
    pub iff: Option<FriendFoe>,
    pub transponder_on: bool,
    pub transponder_mode: TransponderMode,
}

impl Default for ClassificationInput {
    fn default() -> Self {
        Self {
            iff: None,
            transponder_on: false,
            transponder_mode: TransponderMode::Silent,
        }
    }
}

/// Identifies the fused track the Ship FSM should treat as the active docking target, by one of
/// its member per-source keys (stable across fusion cluster churn; the `fused_id` itself is not
/// suitable as a stable handle across a full re-association).
#[derive(Debug, Clone)]
pub struct DockingTarget {
    pub source_id: String,
    pub source_track_id: String,
}

/// Caller-supplied signals the radar subsystem cannot itself observe: BIOS/provider health,
/// actuator confirmation, and FSM commands (spec §4.6 Non-goals: those subsystems are out of
/// scope here and are passed through as already-resolved booleans).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalFsmInputs {
    pub bios_ok: bool,
    pub sensors_ok: bool,
    pub provider_ok: bool,
    pub docking_engaged: bool,
    pub command: Option<FsmCommand>,
}

/// Everything one `tick()` call produces, for the caller (CLI harnesses, tests) to inspect.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub ts: f64,
    pub fused_count: usize,
    pub guard_alerts: usize,
    pub fsm_transition: TransitionRecordSummary,
    pub render_plan: RenderPlan,
    pub frame_ms: f64,
}

/// Owned snapshot of a `TransitionRecord` so `TickReport` doesn't borrow from the FSM.
#[derive(Debug, Clone)]
pub struct TransitionRecordSummary {
    pub to_state: String,
    pub trigger_event: String,
}

impl From<&TransitionRecord> for TransitionRecordSummary {
    fn from(r: &TransitionRecord) -> Self {
        Self {
            to_state: format!("{:?}", r.to_state),
            trigger_event: r.trigger_event.clone(),
        }
    }
}

pub struct RadarPipeline {
    clock: Arc<dyn Clock>,
    event_store: Arc<EventStore>,
    track_store: TrackStore,
    fusion: FusionEngine,
    fusion_enabled: bool,
    guard_cadence: RadarGuardCadence,
    fsm: ShipFsm,
    health: HealthMonitor,
    adaptive: AdaptiveDegradePolicy,
    metrics: FrameMetrics,
    render_policy: RenderPolicy,
    replay_source: Option<ReplaySource>,
    docking_target: Option<DockingTarget>,
    frame_budget_ms: f64,
    session_start_ts: f64,
}

impl RadarPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &RuntimeConfig,
        clock: Arc<dyn Clock>,
        event_store: Arc<EventStore>,
        guard_table: GuardTable,
        render_policy: RenderPolicy,
        docking_target: Option<DockingTarget>,
        frame_budget_ms: f64,
        replay_source: Option<ReplaySource>,
    ) -> Self {
        let session_start_ts = clock.now();
        Self {
            fusion: FusionEngine::new(config.fusion.clone(), clock.clone()),
            fusion_enabled: config.fusion.enabled,
            guard_cadence: RadarGuardCadence::new(guard_table, config.fusion.cooldown_s),
            fsm: ShipFsm::new(config.fsm.clone(), config.sensor.clone()),
            health: HealthMonitor::new(config.health.clone()),
            adaptive: AdaptiveDegradePolicy::new(render_policy.adaptive),
            metrics: FrameMetrics::new(256),
            track_store: TrackStore::new(crate::track_store::TrackStoreConfig::default()),
            render_policy,
            replay_source,
            docking_target,
            frame_budget_ms,
            clock,
            event_store,
            session_start_ts,
        }
    }

    fn build_radar_tracks(
        &self,
        fused: &[crate::fusion::FusedTrack],
        classifications: &HashMap<String, ClassificationInput>,
        now_ts: f64,
    ) -> Vec<RadarTrack> {
        fused
            .iter()
            .map(|f| {
                let class = classifications.get(&f.fused_id).copied().unwrap_or_default();
                let range_m = (f.pos_xy.0.powi(2) + f.pos_xy.1.powi(2)).sqrt();
                let vr_mps = if range_m > f64::EPSILON {
                    (f.pos_xy.0 * f.vel_xy.0 + f.pos_xy.1 * f.vel_xy.1) / range_m
                } else {
                    0.0
                };
                RadarTrack {
                    track_id: f.fused_id.clone(),
                    ts_event: now_ts,
                    range_m,
                    quality: f.quality,
                    iff: class.iff.unwrap_or(FriendFoe::Unknown),
                    transponder_on: class.transponder_on,
                    transponder_mode: class.transponder_mode,
                    vr_mps,
                }
            })
            .collect()
    }

    fn docking_inputs(
        &self,
        fused: &[crate::fusion::FusedTrack],
        now_ts: f64,
    ) -> (bool, Option<f64>, Option<f64>) {
        let Some(target) = &self.docking_target else {
            return (false, None, None);
        };
        let key = (target.source_id.clone(), target.source_track_id.clone());
        match fused.iter().find(|f| f.member_keys.contains(&key)) {
            Some(f) => (true, Some(now_ts - f.last_update_ts), Some(f.quality)),
            None => (false, None, None),
        }
    }

    /// Advance one tick. In replay mode, `observations` is ignored and the next batch of due
    /// events is drained from the loaded trace instead (spec §4.7 step 2); live callers pass the
    /// frame's observations directly.
    pub fn tick(
        &mut self,
        observations: &[Observation],
        classifications: &HashMap<String, ClassificationInput>,
        fsm_inputs: ExternalFsmInputs,
    ) -> TickReport {
        let wall_start = std::time::Instant::now();
        let now_ts = self.clock.now();

        let live_observations: Vec<Observation>;
        let frame_observations: &[Observation] = if let Some(replay) = self.replay_source.as_mut() {
            let due = replay.due_before(now_ts);
            live_observations = due
                .iter()
                .filter_map(trace_export::observation_from_event)
                .collect();
            &live_observations
        } else {
            observations
        };

        self.track_store.ingest(frame_observations, Some(&self.event_store));

        let source_tracks: Vec<&crate::track_store::SourceTrack> =
            self.track_store.tracks().collect();
        let fused = if self.fusion_enabled {
            self.fusion.fuse(&source_tracks, Some(&self.event_store))
        } else {
            Vec::new()
        };

        let radar_tracks = self.build_radar_tracks(&fused, classifications, now_ts);
        let mut guard_alerts = 0usize;
        for track in &radar_tracks {
            let alerts = self.guard_cadence.update(track);
            for alert in &alerts {
                let _ = self.event_store.append(
                    "GUARD",
                    "GUARD_ALERT",
                    serde_json::json!({
                        "rule_id": alert.rule_id,
                        "severity": alert.severity,
                        "track_id": alert.track_id,
                        "range_m": alert.range_m,
                        "quality": alert.quality,
                    }),
                    TruthState::Ok,
                    alert.fsm_event.clone(),
                    Some(now_ts),
                );
                guard_alerts += 1;
            }
        }

        let (docking_target_in_range, docking_track_age_s, docking_track_quality) =
            self.docking_inputs(&fused, now_ts);
        let tick_inputs = TickInputs {
            bios_ok: fsm_inputs.bios_ok,
            sensors_ok: fsm_inputs.sensors_ok,
            provider_ok: fsm_inputs.provider_ok,
            docking_target_in_range,
            docking_track_age_s,
            docking_track_quality,
            docking_engaged: fsm_inputs.docking_engaged,
            command: fsm_inputs.command,
        };
        let transition = self.fsm.step(&tick_inputs, now_ts, Some(&self.event_store));

        let conflict_rate = if self.fusion_enabled {
            if fused.is_empty() {
                None
            } else {
                let conflicted = fused.iter().filter(|f| f.is_conflict()).count();
                Some(conflicted as f64 / fused.len() as f64)
            }
        } else {
            None
        };

        let frame_ms = wall_start.elapsed().as_secs_f64() * 1000.0;
        let lod_level = self.adaptive.evaluate(
            self.metrics.frame_ms.mean().unwrap_or(frame_ms),
            self.frame_budget_ms,
            now_ts,
            Some(&self.event_store),
        );
        self.metrics.record_tick(frame_ms, lod_level > 0);

        let plan = render::build_plan(radar_tracks.len(), lod_level, self.frame_budget_ms, now_ts);
        let _ = self.event_store.append(
            "RENDER",
            "RADAR_RENDER_TICK",
            serde_json::json!({
                "targets_count": plan.targets_count,
                "lod_level": plan.lod_level,
                "frame_ms": frame_ms,
                "reason": plan.reason,
            }),
            plan.truth_state,
            plan.reason.clone(),
            Some(now_ts),
        );

        self.health.evaluate_tick(
            self.metrics.frame_ms.p95(),
            self.event_store.queue_depth(),
            Some(now_ts - self.session_start_ts),
            self.event_store.dropped_events(),
            conflict_rate,
            Some(&self.event_store),
            now_ts,
        );

        TickReport {
            ts: now_ts,
            fused_count: fused.len(),
            guard_alerts,
            fsm_transition: TransitionRecordSummary::from(&transition),
            render_plan: plan,
            frame_ms,
        }
    }

    pub fn is_replay_exhausted(&self) -> bool {
        match &self.replay_source {
            Some(replay) => replay.is_exhausted(),
            None => true,
        }
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.event_store
    }

    pub fn render_policy(&self) -> &RenderPolicy {
        &self.render_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::RuntimeConfig;

    fn pipeline() -> RadarPipeline {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let event_store = Arc::new(EventStore::memory(1_000, clock.clone(), "test"));
        let config = RuntimeConfig::from_env().unwrap();
        RadarPipeline::new(
            &config,
            clock,
            event_store,
            GuardTable::default_table(),
            RenderPolicy::default_policy(),
            None,
            33.0,
            None,
        )
    }

    fn ok_fsm_inputs() -> ExternalFsmInputs {
        ExternalFsmInputs {
            bios_ok: true,
            sensors_ok: true,
            provider_ok: true,
            docking_engaged: false,
            command: None,
        }
    }

    #[test]
    fn tick_with_no_observations_still_advances_fsm_and_health() {
        let mut pipeline = pipeline();
        let report = pipeline.tick(&[], &HashMap::new(), ok_fsm_inputs());
        assert_eq!(report.fused_count, 0);
        assert_eq!(report.guard_alerts, 0);
    }

    #[test]
    fn two_close_observations_fuse_and_render_plan_reports_one_target() {
        let mut pipeline = pipeline();
        let obs = vec![
            Observation::new("radar-a", 0.0, "1", (0.0, 0.0), (0.0, 0.0), 0.9),
            Observation::new("radar-b", 0.0, "2", (1.0, 1.0), (0.0, 0.0), 0.9),
        ];
        let report = pipeline.tick(&obs, &HashMap::new(), ok_fsm_inputs());
        assert_eq!(report.render_plan.targets_count, report.fused_count);
    }

    #[test]
    fn bios_failure_forces_safe_mode() {
        let mut pipeline = pipeline();
        let mut inputs = ok_fsm_inputs();
        inputs.bios_ok = false;
        let report = pipeline.tick(&[], &HashMap::new(), inputs);
        assert_eq!(report.fsm_transition.to_state, "SafeMode");
    }
}
