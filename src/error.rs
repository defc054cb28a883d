//! Error types for gst-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, detected at construction or when call-time
    /// data contradicts the construction-time geometry.
    #[error("config: {0}")]
    Config(String),

    /// Input tensor or lengths inconsistent with the declared shapes.
    #[error("shape: {0}")]
    Shape(String),

    /// Non-finite values produced by normalization or softmax.
    #[error("numeric: {0}")]
    Numeric(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
