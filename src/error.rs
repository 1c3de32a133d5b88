//! Error types for acoustic-encoders.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration (unknown cell name, zero widths, bad keep-probability).
    #[error("config: {0}")]
    Config(String),

    /// Selected feature exists in the configuration surface but has no implementation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Input tensor does not match the configured layout.
    #[error("shape: {0}")]
    Shape(String),

    /// A parameter path was requested twice from the same store.
    #[error("parameter already exists: {0}")]
    DuplicateParam(String),

    /// A parameter path was looked up but never created.
    #[error("parameter not found: {0}")]
    MissingParam(String),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
