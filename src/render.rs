//! Render policy & adaptive degrade (spec §4.7, §6), grounded in `guard::table`'s
//! load-validate-bundle shape (`include_str!` default + `GuardTableLoader`) and in the
//! confirm-then-commit counter pattern used by `fsm::ShipFsm` (reset-on-fail streaks) and
//! `ftui_render::frame_guardrails` (guardrail severities driving a bounded degradation level).

use crate::event_store::{EventStore, TruthState};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RenderProfile {
    pub bitmap_scales: Vec<f64>,
    #[serde(default)]
    pub trail_length: u32,
    #[serde(default)]
    pub show_labels: bool,
}

impl RenderProfile {
    fn validate(&self, name: &str) -> Result<(), String> {
        if self.bitmap_scales.is_empty() {
            return Err(format!("render profile '{name}': bitmap_scales must be non-empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderProfiles {
    pub navigation: RenderProfile,
    pub docking: RenderProfile,
    pub combat: RenderProfile,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    pub degrade_confirm_frames: u32,
    pub recovery_confirm_frames: u32,
    pub cooldown_ms: u64,
    pub max_level: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderPolicy {
    pub schema_version: u32,
    pub defaults: RenderProfile,
    pub profiles: RenderProfiles,
    pub adaptive: AdaptiveConfig,
}

const DEFAULT_RENDER_POLICY_YAML: &str = include_str!("default_render_policy.yaml");

impl RenderPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != 1 {
            return Err(format!(
                "render policy schema_version {} unsupported, expected 1",
                self.schema_version
            ));
        }
        self.defaults.validate("defaults")?;
        self.profiles.navigation.validate("navigation")?;
        self.profiles.docking.validate("docking")?;
        self.profiles.combat.validate("combat")?;
        Ok(())
    }

    pub fn default_policy() -> Self {
        serde_yaml::from_str(DEFAULT_RENDER_POLICY_YAML)
            .expect("bundled default_render_policy.yaml must parse")
    }
}

pub struct RenderPolicyLoader {
    pub path: Option<std::path::PathBuf>,
}

impl RenderPolicyLoader {
    pub fn new(path: Option<std::path::PathBuf>) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<RenderPolicy, String> {
        let policy = match &self.path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| format!("render policy not found: {path:?}: {e}"))?;
                serde_yaml::from_str::<RenderPolicy>(&raw)
                    .map_err(|e| format!("invalid render policy YAML at {path:?}: {e}"))?
            }
            None => RenderPolicy::default_policy(),
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Per-tick derived view of the radar world (spec §3, §4.7). Never mutated after construction.
#[derive(Debug, Clone)]
pub struct RenderPlan {
    pub targets_count: usize,
    pub lod_level: u32,
    pub frame_budget_ms: f64,
    pub truth_state: TruthState,
    pub reason: String,
}

/// Bounded degrade/recover level driven by sustained frame-budget exceedance, grounded in the
/// same "N consecutive ticks before committing, any failure resets the streak" shape as
/// `ShipFsm`'s safe-mode exit and docking confirmation counters.
pub struct AdaptiveDegradePolicy {
    cfg: AdaptiveConfig,
    level: u32,
    degrade_hits: u32,
    recover_hits: u32,
    last_change_ms: Option<f64>,
}

impl AdaptiveDegradePolicy {
    pub fn new(cfg: AdaptiveConfig) -> Self {
        Self {
            cfg,
            level: 0,
            degrade_hits: 0,
            recover_hits: 0,
            last_change_ms: None,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    fn cooldown_elapsed(&self, now_ms: f64) -> bool {
        self.last_change_ms
            .map_or(true, |last| now_ms - last >= self.cfg.cooldown_ms as f64)
    }

    /// Evaluate one tick's frame timing against `frame_budget_ms`. Returns the (possibly
    /// updated) degrade level. `frame_ms_avg` is the recent rolling average, not a single
    /// sample, so one transient spike cannot flip the level.
    pub fn evaluate(
        &mut self,
        frame_ms_avg: f64,
        frame_budget_ms: f64,
        now_ts: f64,
        event_store: Option<&EventStore>,
    ) -> u32 {
        if !self.cfg.enabled {
            return 0;
        }
        let now_ms = now_ts * 1000.0;
        let exceeded = frame_ms_avg > frame_budget_ms;

        if exceeded {
            self.recover_hits = 0;
            self.degrade_hits += 1;
            if self.degrade_hits >= self.cfg.degrade_confirm_frames
                && self.level < self.cfg.max_level
                && self.cooldown_elapsed(now_ms)
            {
                self.level += 1;
                self.degrade_hits = 0;
                self.last_change_ms = Some(now_ms);
                if let Some(store) = event_store {
                    let _ = store.append(
                        "RENDER",
                        "POLICY_DEGRADE",
                        serde_json::json!({
                            "level": self.level,
                            "frame_ms_avg": frame_ms_avg,
                            "frame_budget_ms": frame_budget_ms,
                        }),
                        TruthState::Ok,
                        "FRAME_BUDGET_EXCEEDED",
                        Some(now_ts),
                    );
                }
            }
        } else {
            self.degrade_hits = 0;
            if self.level > 0 {
                self.recover_hits += 1;
                if self.recover_hits >= self.cfg.recovery_confirm_frames
                    && self.cooldown_elapsed(now_ms)
                {
                    self.level -= 1;
                    self.recover_hits = 0;
                    self.last_change_ms = Some(now_ms);
                    if let Some(store) = event_store {
                        let _ = store.append(
                            "RENDER",
                            "POLICY_RECOVERED",
                            serde_json::json!({
                                "level": self.level,
                                "frame_ms_avg": frame_ms_avg,
                                "frame_budget_ms": frame_budget_ms,
                            }),
                            TruthState::Ok,
                            "SUSTAINED_RECOVERY",
                            Some(now_ts),
                        );
                    }
                }
            } else {
                self.recover_hits = 0;
            }
        }

        self.level
    }
}

/// Build this tick's `RenderPlan` from the current target count and degrade level.
pub fn build_plan(targets_count: usize, lod_level: u32, frame_budget_ms: f64, now_ts: f64) -> RenderPlan {
    let _ = now_ts;
    let reason = if lod_level == 0 {
        "NOMINAL".to_string()
    } else {
        format!("DEGRADED_LOD_{lod_level}")
    };
    RenderPlan {
        targets_count,
        lod_level,
        frame_budget_ms,
        truth_state: TruthState::Ok,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptive_cfg() -> AdaptiveConfig {
        AdaptiveConfig {
            enabled: true,
            degrade_confirm_frames: 3,
            recovery_confirm_frames: 2,
            cooldown_ms: 0,
            max_level: 2,
        }
    }

    #[test]
    fn default_policy_parses_and_validates() {
        let policy = RenderPolicy::default_policy();
        assert!(policy.validate().is_ok());
        assert!(!policy.profiles.navigation.bitmap_scales.is_empty());
    }

    #[test]
    fn sustained_exceedance_degrades_after_confirm_frames() {
        let mut policy = AdaptiveDegradePolicy::new(adaptive_cfg());
        assert_eq!(policy.evaluate(100.0, 50.0, 0.0, None), 0);
        assert_eq!(policy.evaluate(100.0, 50.0, 1.0, None), 0);
        assert_eq!(policy.evaluate(100.0, 50.0, 2.0, None), 1, "third consecutive exceedance commits");
    }

    #[test]
    fn single_good_tick_does_not_reset_already_committed_level() {
        let mut policy = AdaptiveDegradePolicy::new(adaptive_cfg());
        for ts in [0.0, 1.0, 2.0] {
            policy.evaluate(100.0, 50.0, ts, None);
        }
        assert_eq!(policy.level(), 1);
        // One good tick alone isn't enough to recover (recovery_confirm_frames=2).
        assert_eq!(policy.evaluate(10.0, 50.0, 3.0, None), 1);
        assert_eq!(policy.evaluate(10.0, 50.0, 4.0, None), 0, "second consecutive good tick recovers");
    }

    #[test]
    fn disabled_policy_always_reports_level_zero() {
        let mut cfg = adaptive_cfg();
        cfg.enabled = false;
        let mut policy = AdaptiveDegradePolicy::new(cfg);
        for ts in [0.0, 1.0, 2.0, 3.0] {
            assert_eq!(policy.evaluate(500.0, 50.0, ts, None), 0);
        }
    }

    #[test]
    fn build_plan_reports_degraded_reason() {
        let plan = build_plan(42, 2, 100.0, 5.0);
        assert_eq!(plan.targets_count, 42);
        assert_eq!(plan.reason, "DEGRADED_LOD_2");
        assert_eq!(plan.truth_state, TruthState::Ok);
    }
}
