//! Library error taxonomy.

use std::path::PathBuf;

/// Errors surfaced by the scheduler library.
///
/// Per-job failures (stage timeouts, constraint violations) are not errors in
/// this sense: they are resolved at job granularity by the driver and never
/// abort the loop. This enum covers the operations that can genuinely fail
/// toward the caller: queue persistence and configuration.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid job queue: {0}")]
    InvalidQueue(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed queue JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed options file: {0}")]
    Config(#[from] toml::de::Error),
}

/// Errors reported by device collaborators.
///
/// Only the synchronous calls carry a result; fire-and-forget commands report
/// failures through status notifications instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("{family} is unreachable")]
    Unreachable { family: &'static str },

    #[error("{family} rejected the request: {reason}")]
    Rejected { family: &'static str, reason: String },
}
