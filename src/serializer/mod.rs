//! Serializers for captured shadow stacks
//!
//! Three fixed variants share one two-step contract:
//!
//! - `init(config)` prepares the output sink. Failure is logged and disables
//!   the serializer; it never aborts capture.
//! - `serialize(snapshot)` writes the frozen snapshot, applying the method
//!   filter per event with one decision cache shared by every thread in the
//!   pass.
//!
//! | Variant   | Output                                         |
//! |-----------|------------------------------------------------|
//! | Binary    | fixed-width little-endian thread blocks        |
//! | Debug     | indented `[START]`/`[ END ]` text per thread   |
//! | Streaming | structured events on a live transport          |

pub mod binary;
pub mod debug;
pub mod streaming;

#[cfg(test)]
mod tests;

use crate::config::{CaptureConfig, SerializerKind};
use crate::error::Result;
use crate::shadow_stack::SessionSnapshot;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use binary::BinarySerializer;
pub use debug::DebugSerializer;
pub use streaming::StreamingSerializer;

/// What one serialization pass produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SerializeStats {
    pub threads: usize,
    pub events_written: u64,
    pub events_filtered: u64,
    /// Files created by the pass (empty for streaming)
    pub files: Vec<PathBuf>,
}

impl SerializeStats {
    fn absorb(&mut self, written: u64, filtered: u64) {
        self.threads += 1;
        self.events_written += written;
        self.events_filtered += filtered;
    }
}

/// Common contract of every output encoding
pub trait ShadowStackSerializer {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Prepare the sink. Never fails; an unusable sink disables the serializer.
    fn init(&mut self, config: &CaptureConfig);

    fn is_enabled(&self) -> bool;

    fn serialize(&self, snapshot: &SessionSnapshot) -> Result<SerializeStats>;
}

/// The closed set of serializer variants
#[derive(Debug)]
pub enum Serializer {
    Binary(BinarySerializer),
    Debug(DebugSerializer),
    Streaming(Arc<StreamingSerializer>),
}

impl Serializer {
    pub fn kind(&self) -> SerializerKind {
        match self {
            Serializer::Binary(_) => SerializerKind::Binary,
            Serializer::Debug(_) => SerializerKind::Debug,
            Serializer::Streaming(_) => SerializerKind::Streaming,
        }
    }

    fn as_dyn(&self) -> &dyn ShadowStackSerializer {
        match self {
            Serializer::Binary(s) => s,
            Serializer::Debug(s) => s,
            Serializer::Streaming(s) => s.as_ref(),
        }
    }
}

impl ShadowStackSerializer for Serializer {
    fn name(&self) -> &'static str {
        self.as_dyn().name()
    }

    fn init(&mut self, config: &CaptureConfig) {
        match self {
            Serializer::Binary(s) => s.init(config),
            Serializer::Debug(s) => s.init(config),
            // the schema lives behind interior mutability, see StreamingSerializer
            Serializer::Streaming(s) => s.register_schema(),
        }
    }

    fn is_enabled(&self) -> bool {
        self.as_dyn().is_enabled()
    }

    fn serialize(&self, snapshot: &SessionSnapshot) -> Result<SerializeStats> {
        self.as_dyn().serialize(snapshot)
    }
}

/// False when `path` names a parent directory that is missing
pub(crate) fn parent_exists(path: &Path) -> bool {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.is_dir(),
        _ => true,
    }
}
