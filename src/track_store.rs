//! Per-source observation-to-track association (spec §4.3), grounded in
//! `original_source/.../test_radar_fusion.py`'s use of `ingest_observations`/`Observation`.

use crate::event_store::{EventStore, TruthState};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTrackStatus {
    New,
    Tracked,
    Coasting,
    Lost,
}

/// One raw measurement from one sensor source at one time. `source_id` is required; an
/// observation missing it is dropped with `SENSOR_OBSERVATION_DROPPED` (reason
/// `MISSING_SOURCE_ID`) before it ever reaches the store.
#[derive(Debug, Clone)]
pub struct Observation {
    pub source_id: String,
    pub ts_event: f64,
    pub source_track_id: String,
    pub pos_xy: (f64, f64),
    pub vel_xy: (f64, f64),
    pub quality: f64,
}

impl Observation {
    pub fn new(
        source_id: impl Into<String>,
        ts_event: f64,
        source_track_id: impl Into<String>,
        pos_xy: (f64, f64),
        vel_xy: (f64, f64),
        quality: f64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            ts_event,
            source_track_id: source_track_id.into(),
            pos_xy,
            vel_xy,
            quality,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTrack {
    pub source_id: String,
    pub source_track_id: String,
    pub pos_xy: (f64, f64),
    pub vel_xy: (f64, f64),
    pub quality: f64,
    pub hits: u32,
    pub miss_count: u32,
    pub last_update_ts: f64,
    pub status: SourceTrackStatus,
}

impl SourceTrack {
    pub fn key(&self) -> (String, String) {
        (self.source_id.clone(), self.source_track_id.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackStoreConfig {
    pub min_hits_to_confirm: u32,
    pub max_misses: u32,
    pub staleness_bound_s: f64,
    /// Blend weight applied to a new observation against the constant-velocity prediction;
    /// 1.0 trusts the observation fully, 0.0 trusts the prediction fully (spec §4.3's
    /// "simple constant-velocity smoothing", explicitly not a Kalman filter).
    pub smoothing_alpha: f64,
    /// Multiplicative quality attenuation applied to a coasting track each frame it is missed.
    pub coast_quality_decay: f64,
}

impl Default for TrackStoreConfig {
    fn default() -> Self {
        Self {
            min_hits_to_confirm: 3,
            max_misses: 5,
            staleness_bound_s: 5.0,
            smoothing_alpha: 0.35,
            coast_quality_decay: 0.9,
        }
    }
}

pub struct TrackStore {
    cfg: TrackStoreConfig,
    tracks: IndexMap<(String, String), SourceTrack>,
}

impl TrackStore {
    pub fn new(cfg: TrackStoreConfig) -> Self {
        Self {
            cfg,
            tracks: IndexMap::new(),
        }
    }

    /// Ingest one frame of observations. Returns the keys touched this frame so the caller can
    /// tell which tracks are "live" vs merely surviving from a prior frame.
    pub fn ingest(
        &mut self,
        observations: &[Observation],
        event_store: Option<&EventStore>,
    ) -> Vec<(String, String)> {
        let mut touched = Vec::with_capacity(observations.len());

        for obs in observations {
            if obs.source_id.trim().is_empty() {
                if let Some(store) = event_store {
                    let _ = store.append(
                        "SENSORS",
                        "SENSOR_OBSERVATION_DROPPED",
                        serde_json::json!({"source_track_id": obs.source_track_id}),
                        TruthState::NoData,
                        "MISSING_SOURCE_ID",
                        Some(obs.ts_event),
                    );
                }
                continue;
            }

            let key = (obs.source_id.clone(), obs.source_track_id.clone());
            touched.push(key.clone());

            let updated: SourceTrack = match self.tracks.get_mut(&key) {
                Some(existing) if (obs.ts_event - existing.last_update_ts) <= self.cfg.staleness_bound_s => {
                    let dt = (obs.ts_event - existing.last_update_ts).max(0.0);
                    let predicted = (
                        existing.pos_xy.0 + existing.vel_xy.0 * dt,
                        existing.pos_xy.1 + existing.vel_xy.1 * dt,
                    );
                    let alpha = self.cfg.smoothing_alpha;
                    existing.pos_xy = (
                        predicted.0 + (obs.pos_xy.0 - predicted.0) * alpha,
                        predicted.1 + (obs.pos_xy.1 - predicted.1) * alpha,
                    );
                    existing.vel_xy = (
                        existing.vel_xy.0 + (obs.vel_xy.0 - existing.vel_xy.0) * alpha,
                        existing.vel_xy.1 + (obs.vel_xy.1 - existing.vel_xy.1) * alpha,
                    );
                    existing.quality = obs.quality.clamp(0.0, 1.0);
                    existing.hits += 1;
                    existing.miss_count = 0;
                    existing.last_update_ts = obs.ts_event;
                    if existing.status == SourceTrackStatus::New
                        && existing.hits >= self.cfg.min_hits_to_confirm
                    {
                        existing.status = SourceTrackStatus::Tracked;
                    } else if existing.status == SourceTrackStatus::Coasting {
                        existing.status = SourceTrackStatus::Tracked;
                    }
                    existing.clone()
                }
                _ => {
                    let track = SourceTrack {
                        source_id: obs.source_id.clone(),
                        source_track_id: obs.source_track_id.clone(),
                        pos_xy: obs.pos_xy,
                        vel_xy: obs.vel_xy,
                        quality: obs.quality.clamp(0.0, 1.0),
                        hits: 1,
                        miss_count: 0,
                        last_update_ts: obs.ts_event,
                        status: SourceTrackStatus::New,
                    };
                    self.tracks.insert(key, track.clone());
                    track
                }
            };

            if let Some(store) = event_store {
                let _ = store.append(
                    "TRACKS",
                    "SOURCE_TRACK_UPDATED",
                    serde_json::json!({
                        "source_id": updated.source_id,
                        "source_track_id": updated.source_track_id,
                        "pos_xy": updated.pos_xy,
                        "vel_xy": updated.vel_xy,
                        "quality": updated.quality,
                        "status": updated.status,
                        "hits": updated.hits,
                    }),
                    TruthState::Ok,
                    "OBSERVATION_ASSOCIATED",
                    Some(obs.ts_event),
                );
            }
        }

        self.age_untouched(&touched, event_store, observations.last().map(|o| o.ts_event));
        touched
    }

    fn age_untouched(
        &mut self,
        touched: &[(String, String)],
        event_store: Option<&EventStore>,
        now_ts: Option<f64>,
    ) {
        let mut lost_keys = Vec::new();
        for (key, track) in self.tracks.iter_mut() {
            if touched.contains(key) {
                continue;
            }
            track.miss_count += 1;
            if track.status == SourceTrackStatus::Tracked && track.miss_count == 1 {
                track.status = SourceTrackStatus::Coasting;
            }
            if track.status == SourceTrackStatus::Coasting {
                track.quality = (track.quality * self.cfg.coast_quality_decay).clamp(0.0, 1.0);
            }
            if track.miss_count > self.cfg.max_misses {
                lost_keys.push(key.clone());
            }
        }

        for key in lost_keys {
            if let Some(track) = self.tracks.shift_remove(&key) {
                if let Some(store) = event_store {
                    let _ = store.append(
                        "TRACKS",
                        "SOURCE_TRACK_LOST",
                        serde_json::json!({
                            "source_id": track.source_id,
                            "source_track_id": track.source_track_id,
                            "miss_count": track.miss_count,
                        }),
                        TruthState::Ok,
                        "MAX_MISSES_EXCEEDED",
                        now_ts,
                    );
                }
            }
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &SourceTrack> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
