use thiserror::Error;

/// Errors surfaced across the public ingest/flush boundary.
///
/// Transport-layer failures are resolved inside the retry processor and
/// never appear here; callers only ever observe validation and
/// configuration failures synchronously.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed or incomplete event. Dropped, logged, never retried.
    #[error("invalid event: {0}")]
    Validation(String),

    /// Missing required downstream identifier. Abandoned, not retried,
    /// since retrying cannot fix a static misconfiguration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transient transport condition (queue full, connection refused).
    #[error("recoverable transport error: {0}")]
    RecoverableTransport(String),

    /// Remote rejected the request with a non-retryable status.
    #[error("terminal remote error: status {0}")]
    TerminalRemote(u16),

    /// Corrupted persisted record. Affects only the one record.
    #[error("corrupt persisted record: {0}")]
    Decode(String),
}
