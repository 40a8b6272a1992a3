//! Typed error kinds shared across the core. Library code returns `Result<_, CoreError>`;
//! binaries convert to `anyhow::Result` at the outermost layer only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown plugin '{0}' for kind {1}")]
    UnknownPlugin(String, String),

    #[error("plugin dependency cycle detected among: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("event queue full, event dropped")]
    QueueFull,

    #[error("event store writer IO error: {0}")]
    WriterIo(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("resource unavailable: {0}")]
    Unavailable(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("stale data: last update {age_s:.3}s ago exceeds bound")]
    StaleData { age_s: f64 },

    #[error("quality {quality:.3} below floor {floor:.3}")]
    LowQuality { quality: f64, floor: f64 },

    #[error("health check critical: {0}")]
    HealthCrit(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
