//! Edge-triggered, hysteresis-based guard alert cadence (spec §4.5), a direct port of
//! `original_source/.../faststream_bridge/radar_guard_cadence.py`'s `RadarGuardCadence`.
//!
//! Publishes at most one alert per `(rule_id, track_id)` while the condition stays active;
//! re-entry is gated by `cooldown_s` and the pending window is gated by `min_duration_s`. Both
//! operate on simulation time (`track.ts_event`), not wall-clock, so replay reproduces the exact
//! same publish decisions.

use super::table::{GuardEvaluationResult, GuardTable, RadarTrack};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct GuardKeyState {
    first_match_ts: f64,
    last_match_ts: f64,
    last_publish_ts: f64,
    active: bool,
}

pub struct RadarGuardCadence {
    table: GuardTable,
    default_cooldown_s: f64,
    states: HashMap<String, GuardKeyState>,
}

impl RadarGuardCadence {
    pub fn new(table: GuardTable, default_cooldown_s: f64) -> Self {
        Self {
            table,
            default_cooldown_s: default_cooldown_s.max(0.0),
            states: HashMap::new(),
        }
    }

    pub fn reload(&mut self, table: GuardTable) {
        self.table = table;
    }

    /// Evaluate every rule against `track`, returning the edge-triggered alerts to publish this
    /// tick (usually empty).
    pub fn update(&mut self, track: &RadarTrack) -> Vec<GuardEvaluationResult> {
        let now_ts = track.ts_event;
        let mut to_publish = Vec::new();

        for rule in &self.table.rules {
            let key = format!("{}|{}", rule.rule_id, track.track_id);
            let is_active = self.states.get(&key).map_or(false, |s| s.active);
            let matches = rule.matches(track, is_active);

            if !matches {
                if let Some(state) = self.states.get_mut(&key) {
                    if state.active {
                        state.active = false;
                        state.first_match_ts = 0.0;
                        state.last_match_ts = 0.0;
                    }
                }
                continue;
            }

            let min_duration_s = rule.min_duration_s.max(0.0);
            let state = self.states.entry(key.clone()).or_insert_with(|| GuardKeyState {
                first_match_ts: now_ts,
                last_match_ts: now_ts,
                last_publish_ts: f64::NEG_INFINITY,
                active: false,
            });

            if min_duration_s > 0.0
                && state.last_match_ts > 0.0
                && (now_ts - state.last_match_ts) > min_duration_s
            {
                // Long gap since the last match: restart the pending window.
                state.first_match_ts = now_ts;
            }
            if state.first_match_ts == 0.0 {
                state.first_match_ts = now_ts;
            }
            state.last_match_ts = now_ts;

            if state.active {
                continue;
            }

            if min_duration_s > 0.0 && (now_ts - state.first_match_ts) < min_duration_s {
                continue;
            }

            let cooldown_s = rule.cooldown_s.unwrap_or(self.default_cooldown_s).max(0.0);
            if cooldown_s > 0.0 && (now_ts - state.last_publish_ts) < cooldown_s {
                continue;
            }

            state.active = true;
            state.last_publish_ts = now_ts;
            to_publish.push(rule.build_result(track));
        }

        self.gc(now_ts);
        to_publish
    }

    /// Drop inactive keys unseen for 300s to bound memory in long-running stacks with many
    /// transient tracks.
    fn gc(&mut self, now_ts: f64) {
        const TTL_S: f64 = 300.0;
        self.states.retain(|_, state| {
            if state.active {
                return true;
            }
            let last = if state.last_publish_ts.is_finite() {
                state.last_publish_ts
            } else {
                state.last_match_ts
            };
            last == 0.0 || (now_ts - last) <= TTL_S
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::table::{FriendFoe, GuardRule, TransponderMode};

    fn rule(min_duration_s: f64, cooldown_s: Option<f64>) -> GuardRule {
        GuardRule {
            rule_id: "r1".into(),
            description: "test".into(),
            severity: "warning".into(),
            fsm_event: "GUARD_EVENT".into(),
            iff: None,
            require_transponder_on: None,
            allowed_transponder_modes: None,
            min_range_m: 0.0,
            max_range_m: Some(500.0),
            min_quality: 0.0,
            max_radial_velocity_mps: None,
            min_duration_s,
            cooldown_s,
            hysteresis_m: None,
        }
    }

    fn track(ts: f64, range_m: f64) -> RadarTrack {
        RadarTrack {
            track_id: "trk-1".into(),
            ts_event: ts,
            range_m,
            quality: 0.9,
            iff: FriendFoe::Unknown,
            transponder_on: false,
            transponder_mode: TransponderMode::Silent,
            vr_mps: 0.0,
        }
    }

    #[test]
    fn publishes_once_on_edge_then_stays_silent_while_active() {
        let table = GuardTable { schema_version: 1, rules: vec![rule(0.0, Some(2.0))] };
        let mut cadence = RadarGuardCadence::new(table, 2.0);

        let first = cadence.update(&track(0.0, 100.0));
        assert_eq!(first.len(), 1);

        let second = cadence.update(&track(1.0, 100.0));
        assert!(second.is_empty(), "must not republish while condition remains active");
    }

    #[test]
    fn clears_and_republishes_after_cooldown() {
        let table = GuardTable { schema_version: 1, rules: vec![rule(0.0, Some(2.0))] };
        let mut cadence = RadarGuardCadence::new(table, 2.0);

        assert_eq!(cadence.update(&track(0.0, 100.0)).len(), 1);
        // Condition clears: range goes out of bounds.
        assert!(cadence.update(&track(1.0, 1000.0)).is_empty());
        // Re-enters within cooldown: suppressed.
        assert!(cadence.update(&track(1.5, 100.0)).is_empty());
        // Re-enters after cooldown: publishes again.
        assert_eq!(cadence.update(&track(3.0, 100.0)).len(), 1);
    }

    #[test]
    fn min_duration_gates_first_publish() {
        let table = GuardTable { schema_version: 1, rules: vec![rule(2.0, Some(0.0))] };
        let mut cadence = RadarGuardCadence::new(table, 0.0);

        assert!(cadence.update(&track(0.0, 100.0)).is_empty());
        assert!(cadence.update(&track(1.0, 100.0)).is_empty());
        assert_eq!(cadence.update(&track(2.5, 100.0)).len(), 1);
    }

    #[test]
    fn long_gap_resets_pending_window() {
        let table = GuardTable { schema_version: 1, rules: vec![rule(2.0, Some(0.0))] };
        let mut cadence = RadarGuardCadence::new(table, 0.0);

        assert!(cadence.update(&track(0.0, 100.0)).is_empty());
        // Gap of 10s, far exceeding min_duration_s -> pending window restarts.
        assert!(cadence.update(&track(10.0, 100.0)).is_empty());
        assert!(cadence.update(&track(11.0, 100.0)).is_empty());
        assert_eq!(cadence.update(&track(12.5, 100.0)).len(), 1);
    }
}
