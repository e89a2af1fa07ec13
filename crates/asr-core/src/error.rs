//! Error types for the DeepSpeech workspace.

use thiserror::Error;

/// Main error type for model construction and evaluation.
#[derive(Error, Debug)]
pub enum AsrError {
    /// Configuration errors (mismatched dimensions, invalid hyperparameters).
    #[error("Config error: {0}")]
    Config(String),

    /// Model construction errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Inference errors (bad input shapes, too-short batches).
    #[error("Inference error: {0}")]
    Inference(String),

    /// Requested capability is not compiled in or not supported by the device.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Device errors.
    #[error("Device error: {0}")]
    Device(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for ASR operations.
pub type AsrResult<T> = Result<T, AsrError>;
