//! Error types for the capture core
//!
//! Only cold-path operations (configuration, serialization, capture file
//! parsing) return these. The recording path degrades silently instead.

use thiserror::Error;

/// Errors that can occur outside the hot recording path
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidConfig { key: String, value: String },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Snapshot requested before the session was drained")]
    NotQuiescent,

    #[error("Truncated capture file: {0}")]
    Truncated(String),

    #[error("Unknown event tag {tag} in thread {thread_id}")]
    UnknownEventTag { tag: u8, thread_id: i64 },

    #[error("Negative frame count {count} in thread {thread_id}")]
    NegativeFrameCount { count: i64, thread_id: i64 },

    #[error("Streaming transport error: {0}")]
    Transport(String),

    #[error("Serializer is disabled: {0}")]
    SerializerDisabled(&'static str),
}

/// Result type for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;
