//! Error types for the hearth controller

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the hearth controller
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid caller input, rejected before any work is queued
    #[error("invalid input: {0}")]
    Validation(String),

    /// A bounded queue is full; explicit backpressure, retryable by the caller
    #[error("at capacity: {0}")]
    CapacityExceeded(String),

    /// Unknown named resource (camera, source)
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// State file could not be written; in-memory state is unaffected
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Chat/LLM error
    #[error("chat error: {0}")]
    Chat(String),

    /// Camera capture error
    #[error("camera error: {0}")]
    Camera(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
