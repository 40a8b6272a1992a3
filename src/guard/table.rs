//! Guard rule definitions and flat predicate evaluation (spec §4.5), grounded in
//! `original_source/.../core/guard_table.py` (`GuardRule`, `GuardTable`, `GuardTableLoader`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendFoe {
    Friend,
    Foe,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransponderMode {
    Civil,
    Military,
    Emergency,
    Silent,
}

/// A classified radar track as seen by the guard layer, downstream of fusion/IFF
/// classification. Distinct from `track_store::SourceTrack`, which is a raw per-source track.
#[derive(Debug, Clone)]
pub struct RadarTrack {
    pub track_id: String,
    pub ts_event: f64,
    pub range_m: f64,
    pub quality: f64,
    pub iff: FriendFoe,
    pub transponder_on: bool,
    pub transponder_mode: TransponderMode,
    pub vr_mps: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardEvaluationResult {
    pub rule_id: String,
    pub severity: String,
    pub fsm_event: String,
    pub message: String,
    pub track_id: String,
    pub range_m: f64,
    pub quality: f64,
}

fn severity_weight(severity: &str) -> i32 {
    match severity {
        "critical" => 2,
        "warning" => 1,
        _ => 0,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardRule {
    #[serde(rename = "id")]
    pub rule_id: String,
    pub description: String,
    pub severity: String,
    pub fsm_event: String,
    #[serde(default)]
    pub iff: Option<FriendFoe>,
    #[serde(default)]
    pub require_transponder_on: Option<bool>,
    #[serde(default)]
    pub allowed_transponder_modes: Option<Vec<TransponderMode>>,
    #[serde(default)]
    pub min_range_m: f64,
    #[serde(default)]
    pub max_range_m: Option<f64>,
    #[serde(default)]
    pub min_quality: f64,
    #[serde(default)]
    pub max_radial_velocity_mps: Option<f64>,
    /// How long the flat predicate must hold continuously before the first alert fires.
    #[serde(default)]
    pub min_duration_s: f64,
    /// Minimum gap between a clear and the next alert for this (rule, track) key.
    #[serde(default)]
    pub cooldown_s: Option<f64>,
    /// Absolute clearance band (meters) added to `max_range_m` (and subtracted from
    /// `min_range_m`) once a key is already active, so a track hovering at the range boundary
    /// doesn't flap the alert.
    #[serde(default)]
    pub hysteresis_m: Option<f64>,
}

impl GuardRule {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_range_m {
            if max <= self.min_range_m {
                return Err(format!(
                    "rule {}: max_range_m must be greater than min_range_m",
                    self.rule_id
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.min_quality) {
            return Err(format!(
                "rule {}: min_quality must be in [0,1]",
                self.rule_id
            ));
        }
        if let Some(margin) = self.hysteresis_m {
            if margin < 0.0 {
                return Err(format!("rule {}: hysteresis_m must be non-negative", self.rule_id));
            }
        }
        Ok(())
    }

    /// Flat predicate with no hysteresis. `matches` (used by the cadence tracker) widens the
    /// thresholds here when `active` is true.
    fn matches_flat(&self, track: &RadarTrack) -> bool {
        if let Some(iff) = self.iff {
            if track.iff != iff {
                return false;
            }
        }
        if self.require_transponder_on == Some(true) && !track.transponder_on {
            return false;
        }
        if self.require_transponder_on == Some(false) && track.transponder_on {
            return false;
        }
        if let Some(modes) = &self.allowed_transponder_modes {
            if !modes.contains(&track.transponder_mode) {
                return false;
            }
        }
        if track.range_m < self.min_range_m {
            return false;
        }
        if let Some(max) = self.max_range_m {
            if track.range_m > max {
                return false;
            }
        }
        if track.quality < self.min_quality {
            return false;
        }
        if let Some(max_vr) = self.max_radial_velocity_mps {
            if track.vr_mps.abs() > max_vr {
                return false;
            }
        }
        true
    }

    /// Hysteresis-widened predicate used by the cadence tracker: once a key is already active,
    /// the range band widens by the rule's absolute `hysteresis_m` so a track hovering at the
    /// boundary doesn't flap the alert. Only the range bounds widen; quality and radial-velocity
    /// floors are unrelated units and stay flat.
    pub fn matches(&self, track: &RadarTrack, active: bool) -> bool {
        if !active {
            return self.matches_flat(track);
        }

        let margin = self.hysteresis_m.unwrap_or(0.0).max(0.0);
        let widened = GuardRule {
            min_range_m: (self.min_range_m - margin).max(0.0),
            max_range_m: self.max_range_m.map(|m| m + margin),
            ..self.clone()
        };
        widened.matches_flat(track)
    }

    pub fn build_result(&self, track: &RadarTrack) -> GuardEvaluationResult {
        GuardEvaluationResult {
            rule_id: self.rule_id.clone(),
            severity: self.severity.clone(),
            fsm_event: self.fsm_event.clone(),
            message: self.description.clone(),
            track_id: track.track_id.clone(),
            range_m: track.range_m,
            quality: track.quality,
        }
    }

    pub fn evaluate(&self, track: &RadarTrack) -> Option<GuardEvaluationResult> {
        self.matches_flat(track).then(|| self.build_result(track))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardTable {
    pub schema_version: u32,
    #[serde(default)]
    pub rules: Vec<GuardRule>,
}

/// Bundled as a fallback so the core runs with sane defaults even with no external guard
/// rule file configured (mirrors the packaged-resource fallback in `GuardTableLoader`).
const DEFAULT_GUARD_RULES_YAML: &str = include_str!("default_guard_rules.yaml");

impl GuardTable {
    pub fn validate(&self) -> Result<(), String> {
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }

    pub fn evaluate_track(&self, track: &RadarTrack) -> Vec<GuardEvaluationResult> {
        let mut results: Vec<GuardEvaluationResult> =
            self.rules.iter().filter_map(|r| r.evaluate(track)).collect();
        results.sort_by(|a, b| {
            severity_weight(&b.severity)
                .cmp(&severity_weight(&a.severity))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        results
    }

    pub fn evaluate_tracks(&self, tracks: &[RadarTrack]) -> Vec<GuardEvaluationResult> {
        tracks.iter().flat_map(|t| self.evaluate_track(t)).collect()
    }

    pub fn default_table() -> Self {
        serde_yaml::from_str(DEFAULT_GUARD_RULES_YAML)
            .expect("bundled default_guard_rules.yaml must parse")
    }
}

pub struct GuardTableLoader {
    pub path: Option<std::path::PathBuf>,
}

impl GuardTableLoader {
    pub fn new(path: Option<std::path::PathBuf>) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<GuardTable, String> {
        let table = match &self.path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| format!("guard table configuration not found: {path:?}: {e}"))?;
                serde_yaml::from_str::<GuardTable>(&raw)
                    .map_err(|e| format!("invalid guard table YAML at {path:?}: {e}"))?
            }
            None => GuardTable::default_table(),
        };
        table.validate()?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> RadarTrack {
        RadarTrack {
            track_id: "t-1".into(),
            ts_event: 0.0,
            range_m: 500.0,
            quality: 0.8,
            iff: FriendFoe::Unknown,
            transponder_on: false,
            transponder_mode: TransponderMode::Silent,
            vr_mps: 0.0,
        }
    }

    #[test]
    fn default_table_parses_and_validates() {
        let table = GuardTable::default_table();
        assert!(table.validate().is_ok());
        assert!(!table.rules.is_empty());
    }

    #[test]
    fn rule_rejects_outside_range() {
        let rule = GuardRule {
            rule_id: "r1".into(),
            description: "test".into(),
            severity: "warning".into(),
            fsm_event: "GUARD_EVENT".into(),
            iff: None,
            require_transponder_on: None,
            allowed_transponder_modes: None,
            min_range_m: 0.0,
            max_range_m: Some(100.0),
            min_quality: 0.0,
            max_radial_velocity_mps: None,
            min_duration_s: 0.0,
            cooldown_s: None,
            hysteresis_m: None,
        };
        assert!(rule.evaluate(&track()).is_none());
    }

    #[test]
    fn hysteresis_widens_max_range_by_absolute_margin_when_active() {
        let rule = GuardRule {
            rule_id: "r2".into(),
            description: "test".into(),
            severity: "critical".into(),
            fsm_event: "GUARD_EVENT".into(),
            iff: None,
            require_transponder_on: None,
            allowed_transponder_modes: None,
            min_range_m: 0.0,
            max_range_m: Some(70.0),
            min_quality: 0.0,
            max_radial_velocity_mps: None,
            min_duration_s: 0.0,
            cooldown_s: None,
            hysteresis_m: Some(5.0),
        };
        let mut t = track();
        t.range_m = 74.0; // inside the strict band's margin (70 + 5 = 75)
        assert!(!rule.matches(&t, false));
        assert!(rule.matches(&t, true)); // within the widened clearance band

        t.range_m = 76.0; // past the widened bound
        assert!(!rule.matches(&t, true));
    }

    #[test]
    fn results_sort_critical_first() {
        let mut table = GuardTable {
            schema_version: 1,
            rules: vec![],
        };
        table.rules.push(GuardRule {
            rule_id: "warn".into(),
            description: "".into(),
            severity: "warning".into(),
            fsm_event: "E".into(),
            iff: None,
            require_transponder_on: None,
            allowed_transponder_modes: None,
            min_range_m: 0.0,
            max_range_m: None,
            min_quality: 0.0,
            max_radial_velocity_mps: None,
            min_duration_s: 0.0,
            cooldown_s: None,
            hysteresis_m: None,
        });
        table.rules.push(GuardRule {
            rule_id: "crit".into(),
            description: "".into(),
            severity: "critical".into(),
            fsm_event: "E".into(),
            iff: None,
            require_transponder_on: None,
            allowed_transponder_modes: None,
            min_range_m: 0.0,
            max_range_m: None,
            min_quality: 0.0,
            max_radial_velocity_mps: None,
            min_duration_s: 0.0,
            cooldown_s: None,
            hysteresis_m: None,
        });
        let results = table.evaluate_track(&track());
        assert_eq!(results[0].rule_id, "crit");
    }
}
