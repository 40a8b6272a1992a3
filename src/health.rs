//! Health Monitor (spec §4.8): threshold-tiered status per metric, deduplicated so a metric
//! stuck at WARN doesn't spam an event every tick. Tier shape (info/warn/crit bands) generalizes
//! `performance/metrics.rs`'s `HealthScore::compute`, but emits discrete transition events
//! instead of folding everything into one numeric score.

use crate::config::HealthThresholds;
use crate::event_store::{EventStore, TruthState};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthLevel {
    Ok,
    Warn,
    Crit,
    NoData,
}

impl HealthLevel {
    fn as_str(self) -> &'static str {
        match self {
            HealthLevel::Ok => "OK",
            HealthLevel::Warn => "WARN",
            HealthLevel::Crit => "CRIT",
            HealthLevel::NoData => "NO_DATA",
        }
    }
}

pub struct HealthMonitor {
    thresholds: HealthThresholds,
    last_level: HashMap<String, HealthLevel>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            last_level: HashMap::new(),
        }
    }

    pub fn level_of(&self, metric_id: &str) -> Option<HealthLevel> {
        self.last_level.get(metric_id).copied()
    }

    /// Record one metric's level this tick. Emits an event only on a level transition, keyed on
    /// `(metric_id, current_level)` so repeated identical levels stay silent.
    fn sample(
        &mut self,
        metric_id: &str,
        level: HealthLevel,
        message: &str,
        event_store: Option<&EventStore>,
        now_ts: f64,
    ) {
        let prev = self.last_level.insert(metric_id.to_string(), level);
        if prev == Some(level) {
            return;
        }

        let (event_type, truth_state) = match level {
            HealthLevel::Warn => ("HEALTH_WARN", TruthState::Ok),
            HealthLevel::Crit => ("HEALTH_CRIT", TruthState::Ok),
            HealthLevel::NoData => ("HEALTH_NO_DATA", TruthState::NoData),
            HealthLevel::Ok => {
                if matches!(prev, Some(HealthLevel::Warn) | Some(HealthLevel::Crit)) {
                    ("HEALTH_RECOVERED", TruthState::Ok)
                } else {
                    return;
                }
            }
        };

        if let Some(store) = event_store {
            let _ = store.append(
                "HEALTH",
                event_type,
                serde_json::json!({"metric_id": metric_id, "level": level.as_str()}),
                truth_state,
                message,
                Some(now_ts),
            );
        }
    }

    fn tier(value: f64, warn: f64, crit: f64) -> HealthLevel {
        if value >= crit {
            HealthLevel::Crit
        } else if value >= warn {
            HealthLevel::Warn
        } else {
            HealthLevel::Ok
        }
    }

    /// Evaluate the full tick-level metric set (frame latency, SQLite queue depth, session
    /// freshness, dropped events, fusion conflict rate). `None` means the metric has no data
    /// this tick (e.g. an empty rolling window, or fusion disabled) and is reported `NO_DATA`
    /// rather than silently skipped. `dropped_events` is a cumulative counter, not optional: it
    /// is always well-defined as zero when nothing has been dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_tick(
        &mut self,
        frame_ms_p95: Option<f64>,
        sqlite_queue_depth: Option<u64>,
        session_age_s: Option<f64>,
        dropped_events: u64,
        fusion_conflict_rate: Option<f64>,
        event_store: Option<&EventStore>,
        now_ts: f64,
    ) {
        match frame_ms_p95 {
            Some(p95) => {
                let level = Self::tier(
                    p95,
                    self.thresholds.frame_ms_warn,
                    self.thresholds.frame_ms_crit,
                );
                self.sample(
                    "frame_ms_p95",
                    level,
                    &format!("p95={p95:.2}ms"),
                    event_store,
                    now_ts,
                );
            }
            None => self.sample("frame_ms_p95", HealthLevel::NoData, "NO_SAMPLES", event_store, now_ts),
        }

        match sqlite_queue_depth {
            Some(depth) => {
                let level = Self::tier(
                    depth as f64,
                    self.thresholds.sqlite_queue_warn as f64,
                    self.thresholds.sqlite_queue_crit as f64,
                );
                self.sample(
                    "sqlite_queue_depth",
                    level,
                    &format!("depth={depth}"),
                    event_store,
                    now_ts,
                );
            }
            None => self.sample(
                "sqlite_queue_depth",
                HealthLevel::NoData,
                "MEMORY_BACKEND_HAS_NO_QUEUE",
                event_store,
                now_ts,
            ),
        }

        match session_age_s {
            Some(age_s) => {
                let level = Self::tier(
                    age_s * 1000.0,
                    self.thresholds.session_stale_ms as f64,
                    self.thresholds.session_stale_ms as f64 * 2.0,
                );
                self.sample(
                    "session_freshness",
                    level,
                    &format!("age_s={age_s:.3}"),
                    event_store,
                    now_ts,
                );
            }
            None => self.sample(
                "session_freshness",
                HealthLevel::NoData,
                "NO_CLOCK_SAMPLE",
                event_store,
                now_ts,
            ),
        }

        let dropped_level = Self::tier(
            dropped_events as f64,
            self.thresholds.dropped_events_warn as f64,
            self.thresholds.dropped_events_crit as f64,
        );
        self.sample(
            "dropped_events",
            dropped_level,
            &format!("dropped={dropped_events}"),
            event_store,
            now_ts,
        );

        match fusion_conflict_rate {
            Some(rate) => {
                let level = Self::tier(
                    rate,
                    self.thresholds.fusion_conflict_rate_warn,
                    self.thresholds.fusion_conflict_rate_crit,
                );
                self.sample(
                    "fusion_conflict_rate",
                    level,
                    &format!("rate={rate:.3}"),
                    event_store,
                    now_ts,
                );
            }
            None => self.sample(
                "fusion_conflict_rate",
                HealthLevel::NoData,
                "FUSION_DISABLED_OR_NO_CLUSTERS",
                event_store,
                now_ts,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::Arc;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            sqlite_queue_warn: 100,
            sqlite_queue_crit: 500,
            session_stale_ms: 5_000,
            frame_ms_warn: 50.0,
            frame_ms_crit: 200.0,
            dropped_events_warn: 1,
            dropped_events_crit: 50,
            fusion_conflict_rate_warn: 0.1,
            fusion_conflict_rate_crit: 0.3,
        }
    }

    #[test]
    fn crosses_into_warn_emits_once() {
        let store = EventStore::memory(100, Arc::new(SystemClock::new()), "t");
        let mut hm = HealthMonitor::new(thresholds());
        hm.evaluate_tick(Some(60.0), Some(10), Some(0.1), 0, Some(0.0), Some(&store), 0.0);
        hm.evaluate_tick(Some(61.0), Some(10), Some(0.1), 0, Some(0.0), Some(&store), 1.0);
        let warns = store.filter(Some("HEALTH"), Some("HEALTH_WARN"), None);
        assert_eq!(warns.len(), 1, "must dedup repeated WARN level");
    }

    #[test]
    fn recovery_after_crit_emits_recovered() {
        let store = EventStore::memory(100, Arc::new(SystemClock::new()), "t");
        let mut hm = HealthMonitor::new(thresholds());
        hm.evaluate_tick(Some(250.0), Some(10), Some(0.1), 0, Some(0.0), Some(&store), 0.0);
        hm.evaluate_tick(Some(10.0), Some(10), Some(0.1), 0, Some(0.0), Some(&store), 1.0);
        let recovered = store.filter(Some("HEALTH"), Some("HEALTH_RECOVERED"), None);
        assert_eq!(recovered.len(), 1);
    }

    #[test]
    fn missing_sample_reports_no_data() {
        let store = EventStore::memory(100, Arc::new(SystemClock::new()), "t");
        let mut hm = HealthMonitor::new(thresholds());
        hm.evaluate_tick(None, Some(10), Some(0.1), 0, None, Some(&store), 0.0);
        let no_data = store.filter(Some("HEALTH"), Some("HEALTH_NO_DATA"), None);
        assert_eq!(no_data.len(), 2, "frame_ms_p95 and fusion_conflict_rate both NO_DATA");
    }

    #[test]
    fn dropped_events_above_crit_emits_health_crit() {
        let store = EventStore::memory(100, Arc::new(SystemClock::new()), "t");
        let mut hm = HealthMonitor::new(thresholds());
        hm.evaluate_tick(Some(10.0), Some(10), Some(0.1), 100, Some(0.0), Some(&store), 0.0);
        let crits = store.filter(Some("HEALTH"), Some("HEALTH_CRIT"), None);
        assert!(crits.iter().any(|e| e.payload["metric_id"] == "dropped_events"));
    }
}
