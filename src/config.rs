// Configuration for a capture session
//
// Settings come from the environment of the instrumented process (the way a
// launcher hands them to an injected profiler) or from a TOML document.

use crate::error::{CaptureError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ENV_BINARY_PATH: &str = "SHADOWTRACE_BINARY_PATH";
pub const ENV_DEBUG_PATH: &str = "SHADOWTRACE_DEBUG_PATH";
pub const ENV_SPLIT_BINARY_FILES: &str = "SHADOWTRACE_SPLIT_BINARY_FILES";
pub const ENV_ONLINE: &str = "SHADOWTRACE_ONLINE";
pub const ENV_METHOD_FILTER: &str = "SHADOWTRACE_METHOD_FILTER";
pub const ENV_SERIALIZER: &str = "SHADOWTRACE_SERIALIZER";

/// Buffer everything until shutdown, or stream every event as it happens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Offline,
    Online,
}

/// Which serializer consumes the captured data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Binary,
    Debug,
    Streaming,
}

impl std::str::FromStr for SerializerKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(SerializerKind::Binary),
            "debug" => Ok(SerializerKind::Debug),
            "streaming" => Ok(SerializerKind::Streaming),
            _ => Err(CaptureError::InvalidConfig {
                key: ENV_SERIALIZER.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Capture session configuration
///
/// # Example
/// ```
/// use shadowtrace::config::{CaptureConfig, CaptureMode};
///
/// let config = CaptureConfig::default();
/// assert_eq!(config.mode, CaptureMode::Offline);
/// assert!(config.method_filter.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Binary capture file, or the base path when splitting per thread
    pub binary_path: Option<PathBuf>,

    /// Human-readable dump destination
    pub debug_path: Option<PathBuf>,

    /// Write one binary file per thread instead of one file for all
    pub split_binary_files: bool,

    pub mode: CaptureMode,

    /// Regex over resolved method names (None = record everything)
    pub method_filter: Option<String>,

    pub serializer: SerializerKind,
}

impl CaptureConfig {
    /// Load configuration from `SHADOWTRACE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let serializer = match non_empty(ENV_SERIALIZER) {
            Some(raw) => raw.parse()?,
            None => SerializerKind::default(),
        };

        let config = Self {
            binary_path: non_empty(ENV_BINARY_PATH).map(PathBuf::from),
            debug_path: non_empty(ENV_DEBUG_PATH).map(PathBuf::from),
            split_binary_files: non_empty(ENV_SPLIT_BINARY_FILES)
                .map(|v| is_true(&v))
                .unwrap_or(false),
            mode: if non_empty(ENV_ONLINE).map(|v| is_true(&v)).unwrap_or(false) {
                CaptureMode::Online
            } else {
                CaptureMode::Offline
            },
            method_filter: non_empty(ENV_METHOD_FILTER),
            serializer,
        };

        Ok(config.normalized())
    }

    /// Parse a TOML document
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Self = toml::from_str(document)?;
        Ok(config.normalized())
    }

    /// Resolve contradictory settings
    ///
    /// - Online capture retains no history, so only the streaming serializer
    ///   can consume it.
    /// - An empty filter pattern means no filter.
    pub fn normalized(mut self) -> Self {
        if self.mode == CaptureMode::Online && self.serializer != SerializerKind::Streaming {
            tracing::warn!(
                serializer = ?self.serializer,
                "Online capture only supports the streaming serializer, switching"
            );
            self.serializer = SerializerKind::Streaming;
        }

        if self
            .method_filter
            .as_deref()
            .is_some_and(|pattern| pattern.trim().is_empty())
        {
            self.method_filter = None;
        }

        self
    }
}

/// Only `1` and `true` (any case) switch a flag on
fn is_true(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true")
}
