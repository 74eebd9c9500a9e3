//! Shadowtrace - shadow stack call-trace capture core
//!
//! This library records per-thread method enter/leave/exception-catch events
//! from a managed runtime's profiling hooks, correlates receiver objects to
//! stable surrogate ids, drains producers safely at shutdown and serializes
//! the captured shadow stacks as binary, indented text or a live event stream.

pub mod cli;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod event;
pub mod method_filter;
pub mod object_table;
pub mod quiescence;
pub mod serializer;
pub mod session;
pub mod shadow_stack;

pub use error::{CaptureError, Result};
pub use session::{CaptureSession, ShutdownReport};
