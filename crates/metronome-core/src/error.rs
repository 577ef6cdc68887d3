use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetronomeError {
    #[error("not initialized: run 'metronome init'")]
    NotInitialized,

    #[error("invalid byte width {0}: must be between 1 and 8")]
    InvalidWidth(usize),

    #[error("buffer length {len} is not a multiple of width {width}")]
    LengthMismatch { len: usize, width: usize },

    #[error("value {value} does not fit in {width} {signedness} byte(s)")]
    OutOfRange {
        value: i128,
        width: usize,
        signedness: &'static str,
    },

    #[error("clock unavailable: {0}")]
    ClockUnavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("worker limiter closed")]
    LimiterClosed,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MetronomeError>;
