//! Cross-source sensor fusion (spec §4.4), grounded in
//! `original_source/.../test_radar_fusion.py` (`associate`/`fuse`/`fuse_tracks`, the anti-flap
//! `fused_id` stability test, and the fusion-enabled pipeline dedup test).

use crate::clock::Clock;
use crate::config::FusionConfig;
use crate::event_store::{EventStore, TruthState};
use crate::track_store::SourceTrack;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Fixed namespace for deriving `fused_id`s deterministically from member track keys. Chosen
/// arbitrarily once and frozen: changing it would silently reassign every fused identity.
const FUSION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6a, 0x51, 0x1b, 0x3e, 0x0c, 0x84, 0x4b, 0x8e, 0x9a, 0x2d, 0x71, 0x5f, 0x0a, 0x3c, 0x9e, 0x11,
]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FusionFlag {
    LowSupport,
    Conflict,
}

#[derive(Debug, Clone)]
pub struct FusedTrack {
    pub fused_id: String,
    pub pos_xy: (f64, f64),
    pub vel_xy: (f64, f64),
    pub quality: f64,
    pub support: usize,
    pub member_keys: Vec<(String, String)>,
    pub flags: Vec<FusionFlag>,
    pub last_update_ts: f64,
}

impl FusedTrack {
    pub fn is_low_support(&self) -> bool {
        self.flags.contains(&FusionFlag::LowSupport)
    }

    pub fn is_conflict(&self) -> bool {
        self.flags.contains(&FusionFlag::Conflict)
    }
}

type MemberKey = (String, String);

/// Cross-frame memory enabling anti-flap identity preservation: a `fused_id` survives a brief
/// re-association of its member tracks instead of being regenerated every tick.
struct FusionStateStore {
    key_to_fused_id: HashMap<MemberKey, (String, f64)>,
    confirm_counts: HashMap<String, u32>,
}

impl FusionStateStore {
    fn new() -> Self {
        Self {
            key_to_fused_id: HashMap::new(),
            confirm_counts: HashMap::new(),
        }
    }

    /// Drop bookkeeping for keys not referenced in the last `ttl_s` seconds: `ttl_s` is the
    /// fused-id's post-loss-of-support retention window (`cooldown_s`), mirroring the `_gc` TTL
    /// cleanup used by the guard cadence tracker. A matching cluster reassociating within the
    /// window reuses the id via `resolve_fused_id`'s vote; once it expires here the id is gone
    /// for good and a fresh one is minted.
    fn gc(&mut self, now_ts: f64, ttl_s: f64) {
        self.key_to_fused_id
            .retain(|_, (_, last_seen)| now_ts - *last_seen <= ttl_s);
        let live_ids: std::collections::HashSet<&String> =
            self.key_to_fused_id.values().map(|(id, _)| id).collect();
        self.confirm_counts.retain(|id, _| live_ids.contains(id));
    }
}

pub struct FusionEngine {
    cfg: FusionConfig,
    clock: Arc<dyn Clock>,
    state: FusionStateStore,
}

impl FusionEngine {
    pub fn new(cfg: FusionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            clock,
            state: FusionStateStore::new(),
        }
    }

    fn gate(&self, a: &SourceTrack, b: &SourceTrack) -> bool {
        let dist = ((a.pos_xy.0 - b.pos_xy.0).powi(2) + (a.pos_xy.1 - b.pos_xy.1).powi(2)).sqrt();
        let dvel = ((a.vel_xy.0 - b.vel_xy.0).powi(2) + (a.vel_xy.1 - b.vel_xy.1).powi(2)).sqrt();
        dist <= self.cfg.gate_dist_m && dvel <= self.cfg.gate_vel_mps
    }

    /// Group tracks into fusion clusters via union-find over the pairwise distance/velocity
    /// gate. Returns index groups into `tracks`.
    fn associate(&self, tracks: &[&SourceTrack]) -> Vec<Vec<usize>> {
        let n = tracks.len();
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], x: usize) -> usize {
            if parent[x] != x {
                parent[x] = find(parent, parent[x]);
            }
            parent[x]
        }

        for i in 0..n {
            for j in (i + 1)..n {
                if self.gate(tracks[i], tracks[j]) {
                    let ri = find(&mut parent, i);
                    let rj = find(&mut parent, j);
                    if ri != rj {
                        parent[ri] = rj;
                    }
                }
            }
        }

        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(i);
        }

        // HashMap iteration order is randomized per process; sort clusters (and their members)
        // lexicographically over (source_id, source_track_id) so output ordering and ids are
        // identical across runs given identical inputs.
        let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
        for group in groups.iter_mut() {
            group.sort_by(|&a, &b| tracks[a].key().cmp(&tracks[b].key()));
        }
        groups.sort_by(|a, b| tracks[a[0]].key().cmp(&tracks[b[0]].key()));
        groups
    }

    fn max_pairwise_dist(tracks: &[&SourceTrack]) -> f64 {
        let mut max_d: f64 = 0.0;
        for i in 0..tracks.len() {
            for j in (i + 1)..tracks.len() {
                let d = ((tracks[i].pos_xy.0 - tracks[j].pos_xy.0).powi(2)
                    + (tracks[i].pos_xy.1 - tracks[j].pos_xy.1).powi(2))
                .sqrt();
                max_d = max_d.max(d);
            }
        }
        max_d
    }

    fn resolve_fused_id(&mut self, keys: &[MemberKey], now_ts: f64) -> String {
        let mut votes: HashMap<String, usize> = HashMap::new();
        for key in keys {
            if let Some((id, _)) = self.state.key_to_fused_id.get(key) {
                *votes.entry(id.clone()).or_insert(0) += 1;
            }
        }
        // Break count ties deterministically (highest count first, then lexicographic id)
        // rather than relying on HashMap iteration order.
        let mut ranked: Vec<(String, usize)> = votes.into_iter().collect();
        ranked.sort_by(|(id_a, count_a), (id_b, count_b)| {
            count_b.cmp(count_a).then_with(|| id_a.cmp(id_b))
        });
        let fused_id = ranked
            .into_iter()
            .next()
            .map(|(id, _)| id)
            .unwrap_or_else(|| {
                let mut sorted: Vec<String> =
                    keys.iter().map(|(s, t)| format!("{s}:{t}")).collect();
                sorted.sort();
                Uuid::new_v5(&FUSION_NAMESPACE, sorted.join("|").as_bytes()).to_string()
            });

        for key in keys {
            self.state
                .key_to_fused_id
                .insert(key.clone(), (fused_id.clone(), now_ts));
        }
        fused_id
    }

    /// Fuse one frame's confirmed source tracks. Only `Tracked`/`Coasting` tracks within
    /// `max_age_s` participate; `New` tracks are excluded as unconfirmed.
    pub fn fuse(
        &mut self,
        tracks: &[&SourceTrack],
        event_store: Option<&EventStore>,
    ) -> Vec<FusedTrack> {
        let now_ts = self.clock.now();
        if !self.cfg.enabled {
            return Vec::new();
        }

        let eligible: Vec<&SourceTrack> = tracks
            .iter()
            .filter(|t| {
                matches!(
                    t.status,
                    crate::track_store::SourceTrackStatus::Tracked
                        | crate::track_store::SourceTrackStatus::Coasting
                )
            })
            .filter(|t| now_ts - t.last_update_ts <= self.cfg.max_age_s)
            .copied()
            .collect();

        let groups = self.associate(&eligible);
        let mut fused_tracks = Vec::with_capacity(groups.len());

        for group in groups {
            let members: Vec<&SourceTrack> = group.iter().map(|&i| eligible[i]).collect();
            let support = members.len();
            let total_quality: f64 = members.iter().map(|t| t.quality).sum();
            let quality = total_quality / support as f64;
            let pos_xy = (
                members.iter().map(|t| t.pos_xy.0).sum::<f64>() / support as f64,
                members.iter().map(|t| t.pos_xy.1).sum::<f64>() / support as f64,
            );
            let vel_xy = (
                members.iter().map(|t| t.vel_xy.0).sum::<f64>() / support as f64,
                members.iter().map(|t| t.vel_xy.1).sum::<f64>() / support as f64,
            );

            let mut flags = Vec::new();
            if support < self.cfg.min_support {
                flags.push(FusionFlag::LowSupport);
            }
            if Self::max_pairwise_dist(&members) > self.cfg.conflict_dist_m {
                flags.push(FusionFlag::Conflict);
            }
            // Low support caps trust outright; conflict derates it instead, since conflicting
            // sources still agree on gross position even if they disagree on detail.
            let quality = if flags.contains(&FusionFlag::LowSupport) {
                quality.min(0.49)
            } else if flags.contains(&FusionFlag::Conflict) {
                quality * 0.5
            } else {
                quality
            };

            let keys: Vec<MemberKey> = members.iter().map(|t| t.key()).collect();
            let fused_id = self.resolve_fused_id(&keys, now_ts);

            if let Some(store) = event_store {
                let _ = store.append(
                    "FUSION",
                    "FUSION_CLUSTER_BUILT",
                    serde_json::json!({
                        "fused_id": fused_id,
                        "support": support,
                        "members": keys.iter().map(|(s, t)| format!("{s}:{t}")).collect::<Vec<_>>(),
                        "low_support": flags.contains(&FusionFlag::LowSupport),
                        "conflict": flags.contains(&FusionFlag::Conflict),
                    }),
                    TruthState::Ok,
                    "CLUSTER_EVALUATED",
                    Some(now_ts),
                );
            }

            let count = self
                .state
                .confirm_counts
                .entry(fused_id.clone())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            let confirmed = *count >= self.cfg.confirm_frames;

            // One `FUSED_TRACK_UPDATED` per fused track per frame once confirmed -- not
            // throttled by `cooldown_s`, which governs fused-id retention after loss of support
            // (see `FusionStateStore::gc`), not emission cadence.
            if confirmed {
                if let Some(store) = event_store {
                    let _ = store.append(
                        "FUSION",
                        "FUSED_TRACK_UPDATED",
                        serde_json::json!({
                            "fused_id": fused_id,
                            "pos_xy": pos_xy,
                            "vel_xy": vel_xy,
                            "quality": quality,
                            "support": support,
                        }),
                        TruthState::Ok,
                        "CONFIRMED",
                        Some(now_ts),
                    );
                }
            }

            fused_tracks.push(FusedTrack {
                fused_id,
                pos_xy,
                vel_xy,
                quality,
                support,
                member_keys: keys,
                flags,
                last_update_ts: now_ts,
            });
        }

        self.state.gc(now_ts, self.cfg.cooldown_s);
        fused_tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ReplayClock;
    use crate::track_store::SourceTrackStatus;

    fn cfg() -> FusionConfig {
        FusionConfig {
            enabled: true,
            gate_dist_m: 10.0,
            gate_vel_mps: 5.0,
            min_support: 2,
            max_age_s: 5.0,
            conflict_dist_m: 50.0,
            confirm_frames: 1,
            cooldown_s: 0.0,
        }
    }

    fn track(source_id: &str, track_id: &str, x: f64, y: f64, ts: f64) -> SourceTrack {
        SourceTrack {
            source_id: source_id.into(),
            source_track_id: track_id.into(),
            pos_xy: (x, y),
            vel_xy: (0.0, 0.0),
            quality: 0.9,
            hits: 5,
            miss_count: 0,
            last_update_ts: ts,
            status: SourceTrackStatus::Tracked,
        }
    }

    #[test]
    fn two_close_sources_fuse_into_one_track() {
        let clock = Arc::new(ReplayClock::new(10.0));
        let mut engine = FusionEngine::new(cfg(), clock);
        let a = track("radar-a", "1", 0.0, 0.0, 10.0);
        let b = track("radar-b", "2", 1.0, 1.0, 10.0);
        let fused = engine.fuse(&[&a, &b], None);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].support, 2);
        assert!(!fused[0].is_low_support());
    }

    #[test]
    fn distant_sources_stay_separate_and_flag_low_support() {
        let clock = Arc::new(ReplayClock::new(10.0));
        let mut engine = FusionEngine::new(cfg(), clock);
        let a = track("radar-a", "1", 0.0, 0.0, 10.0);
        let b = track("radar-b", "2", 1000.0, 1000.0, 10.0);
        let fused = engine.fuse(&[&a, &b], None);
        assert_eq!(fused.len(), 2);
        assert!(fused.iter().all(|f| f.is_low_support()));
    }

    #[test]
    fn fused_id_is_stable_across_frames_despite_membership_churn() {
        let clock = Arc::new(ReplayClock::new(0.0));
        let mut engine = FusionEngine::new(cfg(), clock.clone());

        let a1 = track("radar-a", "1", 0.0, 0.0, 0.0);
        let b1 = track("radar-b", "2", 1.0, 1.0, 0.0);
        let first = engine.fuse(&[&a1, &b1], None);
        let id_frame1 = first[0].fused_id.clone();

        // Frame 2: only source a present (b briefly dropped), still within gate of itself.
        clock.set(1.0);
        let a2 = track("radar-a", "1", 0.5, 0.5, 1.0);
        let second = engine.fuse(&[&a2], None);
        assert_eq!(second[0].fused_id, id_frame1);

        // Frame 3: b rejoins, cluster reforms under the same fused_id.
        clock.set(2.0);
        let a3 = track("radar-a", "1", 0.2, 0.2, 2.0);
        let b3 = track("radar-b", "2", 0.8, 0.8, 2.0);
        let third = engine.fuse(&[&a3, &b3], None);
        assert_eq!(third[0].fused_id, id_frame1);
    }

    #[test]
    fn fusion_is_deterministic_given_identical_inputs() {
        let clock1 = Arc::new(ReplayClock::new(5.0));
        let clock2 = Arc::new(ReplayClock::new(5.0));
        let mut e1 = FusionEngine::new(cfg(), clock1);
        let mut e2 = FusionEngine::new(cfg(), clock2);
        let a = track("radar-a", "1", 0.0, 0.0, 5.0);
        let b = track("radar-b", "2", 1.0, 1.0, 5.0);
        let r1 = e1.fuse(&[&a, &b], None);
        let r2 = e2.fuse(&[&a, &b], None);
        assert_eq!(r1[0].fused_id, r2[0].fused_id);
        assert_eq!(r1[0].pos_xy, r2[0].pos_xy);
    }

    #[test]
    fn multi_cluster_event_order_is_deterministic_across_runs() {
        // Three well-separated clusters, built in a different array order each run, force the
        // union-find HashMap through a different internal bucket layout; the emitted
        // FUSION_CLUSTER_BUILT order must still come out identical both times.
        let tracks_run1 = [
            track("radar-a", "1", 0.0, 0.0, 5.0),
            track("radar-b", "2", 1000.0, 1000.0, 5.0),
            track("radar-c", "3", 2000.0, 2000.0, 5.0),
        ];
        let run1_refs: Vec<&SourceTrack> = vec![&tracks_run1[2], &tracks_run1[0], &tracks_run1[1]];
        let run2_refs: Vec<&SourceTrack> = vec![&tracks_run1[1], &tracks_run1[2], &tracks_run1[0]];

        let clock1 = Arc::new(ReplayClock::new(5.0));
        let clock2 = Arc::new(ReplayClock::new(5.0));
        let mut e1 = FusionEngine::new(cfg(), clock1);
        let mut e2 = FusionEngine::new(cfg(), clock2);
        let store1 = crate::event_store::EventStore::memory(100, Arc::new(ReplayClock::new(5.0)), "t1");
        let store2 = crate::event_store::EventStore::memory(100, Arc::new(ReplayClock::new(5.0)), "t2");

        e1.fuse(&run1_refs, Some(&store1));
        e2.fuse(&run2_refs, Some(&store2));

        let built1 = store1.filter(Some("FUSION"), Some("FUSION_CLUSTER_BUILT"), None);
        let built2 = store2.filter(Some("FUSION"), Some("FUSION_CLUSTER_BUILT"), None);
        let ids1: Vec<_> = built1.iter().map(|e| e.payload["fused_id"].clone()).collect();
        let ids2: Vec<_> = built2.iter().map(|e| e.payload["fused_id"].clone()).collect();
        assert_eq!(ids1, ids2, "cluster emission order must not depend on input array order");
    }

    #[test]
    fn fused_track_updated_emits_every_frame_once_confirmed_regardless_of_cooldown() {
        let mut long_cooldown = cfg();
        long_cooldown.cooldown_s = 100.0;
        let clock = Arc::new(ReplayClock::new(0.0));
        let mut engine = FusionEngine::new(long_cooldown, clock.clone());
        let store = crate::event_store::EventStore::memory(100, Arc::new(ReplayClock::new(0.0)), "t");

        for ts in [0.0, 1.0, 2.0, 3.0] {
            clock.set(ts);
            let a = track("radar-a", "1", 0.0, 0.0, ts);
            let b = track("radar-b", "2", 1.0, 1.0, ts);
            engine.fuse(&[&a, &b], Some(&store));
        }

        let updated = store.filter(Some("FUSION"), Some("FUSED_TRACK_UPDATED"), None);
        assert_eq!(updated.len(), 4, "a sustained cluster must emit once per frame, not throttled by cooldown_s");
    }

    #[test]
    fn disabled_fusion_returns_no_clusters() {
        let mut disabled = cfg();
        disabled.enabled = false;
        let clock = Arc::new(ReplayClock::new(0.0));
        let mut engine = FusionEngine::new(disabled, clock);
        let a = track("radar-a", "1", 0.0, 0.0, 0.0);
        assert!(engine.fuse(&[&a], None).is_empty());
    }
}
