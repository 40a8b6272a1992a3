//! Immutable startup configuration, built once from the environment (spec §4.11 / §6).
//!
//! Every env var in spec.md §6 is parsed here and nowhere else; components receive a typed
//! sub-struct or `&RuntimeConfig` at construction time. Mirrors the teacher's `dotenv::dotenv()`
//! bootstrap so a local `.env` behaves like exported shell variables.

use crate::error::CoreError;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    pub backend: EventStoreBackend,
    pub db_path: String,
    pub batch_size: usize,
    pub queue_max: usize,
    pub flush_ms: u64,
    pub retention_hours: f64,
    pub max_db_mb: f64,
    pub memory_maxlen: usize,
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub enabled: bool,
    pub gate_dist_m: f64,
    pub gate_vel_mps: f64,
    pub min_support: usize,
    pub max_age_s: f64,
    pub conflict_dist_m: f64,
    pub confirm_frames: u32,
    pub cooldown_s: f64,
}

#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub max_age_s: f64,
    pub min_quality: f64,
}

#[derive(Debug, Clone)]
pub struct FsmConfig {
    pub docking_confirmation_count: u32,
    pub safe_exit_confirmation_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FallbackFlags {
    pub allow_bios_fallback: bool,
    pub allow_actuator_fallback: bool,
    pub allow_grpc_fallback: bool,
    pub allow_interface_fallback: bool,
    pub allow_bridge_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub sqlite_queue_warn: u64,
    pub sqlite_queue_crit: u64,
    pub session_stale_ms: u64,
    pub frame_ms_warn: f64,
    pub frame_ms_crit: f64,
    pub dropped_events_warn: u64,
    pub dropped_events_crit: u64,
    pub fusion_conflict_rate_warn: f64,
    pub fusion_conflict_rate_crit: f64,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub strict_mode: bool,
    pub event_store: EventStoreConfig,
    pub fusion: FusionConfig,
    pub sensor: SensorConfig,
    pub fsm: FsmConfig,
    pub fallback: FallbackFlags,
    pub health: HealthThresholds,
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, CoreError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| CoreError::InvalidConfig(format!("{key}={raw} is not valid"))),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool, CoreError> {
    match env::var(key) {
        Ok(raw) => match raw.trim() {
            "1" | "true" | "TRUE" | "on" | "ON" => Ok(true),
            "0" | "false" | "FALSE" | "off" | "OFF" => Ok(false),
            other => Err(CoreError::InvalidConfig(format!(
                "{key}={other} is not a valid boolean"
            ))),
        },
        Err(_) => Ok(default),
    }
}

impl RuntimeConfig {
    /// Load a fresh `.env` (if present) then build from the process environment. Fails fast on
    /// a malformed value rather than silently defaulting.
    pub fn load() -> Result<Self, CoreError> {
        dotenv::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, CoreError> {
        let strict_mode = parse_bool_env("QIKI_STRICT_MODE", false)?;

        let backend = match env::var("EVENTSTORE_BACKEND").as_deref() {
            Ok("sqlite") => EventStoreBackend::Sqlite,
            Ok("memory") | Err(_) => EventStoreBackend::Memory,
            Ok(other) => {
                return Err(CoreError::InvalidConfig(format!(
                    "EVENTSTORE_BACKEND={other} must be 'memory' or 'sqlite'"
                )))
            }
        };

        let event_store = EventStoreConfig {
            backend,
            db_path: env::var("EVENTSTORE_DB_PATH").unwrap_or_else(|_| "qiki_events.db".into()),
            batch_size: parse_env("EVENTSTORE_BATCH_SIZE", 100usize)?,
            queue_max: parse_env("EVENTSTORE_QUEUE_MAX", 10_000usize)?,
            flush_ms: parse_env("EVENTSTORE_FLUSH_MS", 250u64)?,
            retention_hours: parse_env("EVENTSTORE_RETENTION_HOURS", 168.0f64)?,
            max_db_mb: parse_env("EVENTSTORE_MAX_DB_MB", 512.0f64)?,
            memory_maxlen: parse_env("EVENTSTORE_MEMORY_MAXLEN", 10_000usize)?,
        };

        let fusion = FusionConfig {
            enabled: parse_bool_env("RADAR_FUSION_ENABLED", true)?,
            gate_dist_m: parse_env("RADAR_FUSION_GATE_DIST_M", 50.0f64)?,
            gate_vel_mps: parse_env("RADAR_FUSION_GATE_VEL_MPS", 20.0f64)?,
            min_support: parse_env("RADAR_FUSION_MIN_SUPPORT", 2usize)?,
            max_age_s: parse_env("RADAR_FUSION_MAX_AGE_S", 2.0f64)?,
            conflict_dist_m: parse_env("RADAR_FUSION_CONFLICT_DIST_M", 100.0f64)?,
            confirm_frames: parse_env("RADAR_FUSION_CONFIRM_FRAMES", 1u32)?,
            cooldown_s: parse_env("RADAR_FUSION_COOLDOWN_S", 5.0f64)?,
        };

        let sensor = SensorConfig {
            max_age_s: parse_env("QIKI_SENSOR_MAX_AGE_S", 2.0f64)?,
            min_quality: parse_env("QIKI_SENSOR_MIN_QUALITY", 0.3f64)?,
        };

        let fsm = FsmConfig {
            docking_confirmation_count: parse_env("QIKI_DOCKING_CONFIRMATION_COUNT", 3u32)?,
            safe_exit_confirmation_count: parse_env("QIKI_SAFE_EXIT_CONFIRMATION_COUNT", 3u32)?,
        };

        let fallback = FallbackFlags {
            allow_bios_fallback: parse_bool_env("QIKI_ALLOW_BIOS_FALLBACK", false)?,
            allow_actuator_fallback: parse_bool_env("QIKI_ALLOW_ACTUATOR_FALLBACK", false)?,
            allow_grpc_fallback: parse_bool_env("QIKI_ALLOW_GRPC_FALLBACK", false)?,
            allow_interface_fallback: parse_bool_env("QIKI_ALLOW_INTERFACE_FALLBACK", false)?,
            allow_bridge_fallback: parse_bool_env("QIKI_ALLOW_BRIDGE_FALLBACK", false)?,
        };

        let health = HealthThresholds {
            sqlite_queue_warn: parse_env("QIKI_HEALTH_SQLITE_QUEUE_WARN", 1_000u64)?,
            sqlite_queue_crit: parse_env("QIKI_HEALTH_SQLITE_QUEUE_CRIT", 5_000u64)?,
            session_stale_ms: parse_env("QIKI_HEALTH_SESSION_STALE_MS", 5_000u64)?,
            frame_ms_warn: parse_env("QIKI_HEALTH_FRAME_MS_WARN", 50.0f64)?,
            frame_ms_crit: parse_env("QIKI_HEALTH_FRAME_MS_CRIT", 200.0f64)?,
            dropped_events_warn: parse_env("QIKI_HEALTH_DROPPED_EVENTS_WARN", 1u64)?,
            dropped_events_crit: parse_env("QIKI_HEALTH_DROPPED_EVENTS_CRIT", 50u64)?,
            fusion_conflict_rate_warn: parse_env("QIKI_HEALTH_FUSION_CONFLICT_RATE_WARN", 0.1f64)?,
            fusion_conflict_rate_crit: parse_env("QIKI_HEALTH_FUSION_CONFLICT_RATE_CRIT", 0.3f64)?,
        };

        Ok(Self {
            strict_mode,
            event_store,
            fusion,
            sensor,
            fsm,
            fallback,
            health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_are_valid_without_any_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "QIKI_STRICT_MODE",
            "EVENTSTORE_BACKEND",
            "RADAR_FUSION_ENABLED",
        ] {
            env::remove_var(key);
        }
        let cfg = RuntimeConfig::from_env().expect("defaults must parse");
        assert!(!cfg.strict_mode);
        assert_eq!(cfg.event_store.backend, EventStoreBackend::Memory);
        assert!(cfg.fusion.enabled);
    }

    #[test]
    fn invalid_bool_env_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("QIKI_STRICT_MODE", "maybe");
        let result = RuntimeConfig::from_env();
        env::remove_var("QIKI_STRICT_MODE");
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }
}
