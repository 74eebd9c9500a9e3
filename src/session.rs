//! Capture session: the context object host hooks call into
//!
//! A session owns everything one instrumented process needs: the guard,
//! the registry, the method filter, the object table and the configured
//! serializer. Hooks timestamp events with the session's monotonic clock.
//!
//! # Example
//! ```
//! use shadowtrace::collaborators::StaticNameResolver;
//! use shadowtrace::config::{CaptureConfig, SerializerKind};
//! use shadowtrace::session::CaptureSession;
//! use std::sync::Arc;
//!
//! let dir = std::env::temp_dir();
//! let config = CaptureConfig {
//!     debug_path: Some(dir.join("shadowtrace-doc.txt")),
//!     serializer: SerializerKind::Debug,
//!     ..CaptureConfig::default()
//! };
//! let names = StaticNameResolver::new().with_name(1, "MyApp.Main");
//! let session = CaptureSession::builder(config)
//!     .names(Arc::new(names))
//!     .build();
//!
//! session.on_function_enter(1, 42);
//! session.on_function_leave(1, 42);
//!
//! let report = session.shutdown();
//! assert_eq!(report.events_captured, 2);
//! ```

use crate::collaborators::{
    ArgumentSource, GenerationLookup, NameResolver, SignatureInspector, StaticNameResolver,
};
use crate::config::{CaptureConfig, CaptureMode, SerializerKind};
use crate::event::{FunctionId, MonotonicClock, SurrogateId, ThreadId};
use crate::method_filter::MethodFilter;
use crate::object_table::{ObjectCorrelationTable, RelocatedRange};
use crate::quiescence::{DrainStats, QuiescenceGuard};
use crate::serializer::streaming::EventTransport;
use crate::serializer::{
    BinarySerializer, DebugSerializer, SerializeStats, Serializer, ShadowStackSerializer,
    StreamingSerializer,
};
use crate::shadow_stack::{LiveEventSink, RecordingMode, ShadowStackRegistry};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// What happened to the captured data at shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SerializeOutcome {
    Written(SerializeStats),
    /// The serializer was disabled during init
    Skipped,
    Failed(String),
}

/// Result of [`CaptureSession::shutdown`]
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub serializer: &'static str,
    pub drain_rounds: u64,
    pub drain_elapsed: Duration,
    pub threads: usize,
    pub events_captured: usize,
    pub outcome: SerializeOutcome,
}

/// Builder for [`CaptureSession`]
pub struct CaptureSessionBuilder {
    config: CaptureConfig,
    names: Arc<dyn NameResolver>,
    signatures: Arc<dyn SignatureInspector>,
    generations: Arc<dyn GenerationLookup>,
    transport: Option<Arc<dyn EventTransport>>,
}

impl CaptureSessionBuilder {
    /// Display names for filtering and text output
    pub fn names(mut self, names: Arc<dyn NameResolver>) -> Self {
        self.names = names;
        self
    }

    /// Tells which functions take a receiver as their first argument
    pub fn signatures(mut self, signatures: Arc<dyn SignatureInspector>) -> Self {
        self.signatures = signatures;
        self
    }

    /// Confirms a receiver address points at a live object
    pub fn generations(mut self, generations: Arc<dyn GenerationLookup>) -> Self {
        self.generations = generations;
        self
    }

    /// Live channel for the streaming serializer
    pub fn transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Assemble the session and initialize its serializer
    ///
    /// Never fails. Sink problems, including a streaming serializer with no
    /// transport, are logged and leave the serializer disabled.
    pub fn build(self) -> CaptureSession {
        let config = self.config.normalized();
        let filter = MethodFilter::from_pattern(config.method_filter.as_deref(), self.names.clone());

        let mut serializer = match config.serializer {
            SerializerKind::Binary => Serializer::Binary(BinarySerializer::new(filter)),
            SerializerKind::Debug => {
                Serializer::Debug(DebugSerializer::new(filter, self.names.clone()))
            }
            SerializerKind::Streaming => {
                let streaming = match self.transport {
                    Some(transport) => StreamingSerializer::new(transport, filter, self.names.clone()),
                    None => {
                        tracing::error!(
                            "Streaming serializer selected without a transport, streaming disabled"
                        );
                        StreamingSerializer::without_transport(filter, self.names.clone())
                    }
                };
                Serializer::Streaming(Arc::new(streaming))
            }
        };
        serializer.init(&config);

        let mode = match (&config.mode, &serializer) {
            (CaptureMode::Online, Serializer::Streaming(streaming)) => {
                RecordingMode::Online(streaming.clone() as Arc<dyn LiveEventSink>)
            }
            _ => RecordingMode::Offline,
        };

        let guard = Arc::new(QuiescenceGuard::new());
        let registry = ShadowStackRegistry::new(guard.clone(), mode);
        let objects = ObjectCorrelationTable::new(self.signatures, self.generations);

        tracing::info!(
            serializer = serializer.name(),
            enabled = serializer.is_enabled(),
            mode = ?config.mode,
            "Capture session started"
        );

        CaptureSession {
            config,
            clock: MonotonicClock::new(),
            guard,
            registry,
            objects,
            serializer,
            report: OnceLock::new(),
        }
    }
}

/// One capture session per instrumented process
pub struct CaptureSession {
    config: CaptureConfig,
    clock: MonotonicClock,
    guard: Arc<QuiescenceGuard>,
    registry: ShadowStackRegistry,
    objects: ObjectCorrelationTable,
    serializer: Serializer,
    report: OnceLock<ShutdownReport>,
}

impl CaptureSession {
    /// Start building a session
    ///
    /// Defaults: no names, no function takes a receiver, every address is live.
    pub fn builder(config: CaptureConfig) -> CaptureSessionBuilder {
        CaptureSessionBuilder {
            config,
            names: Arc::new(StaticNameResolver::new()),
            signatures: Arc::new(|_: FunctionId| false),
            generations: Arc::new(|_: u64| true),
            transport: None,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn registry(&self) -> &ShadowStackRegistry {
        &self.registry
    }

    pub fn objects(&self) -> &ObjectCorrelationTable {
        &self.objects
    }

    pub fn guard(&self) -> &QuiescenceGuard {
        &self.guard
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// Nanoseconds since the session started
    #[inline]
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    #[inline]
    pub fn on_function_enter(&self, function_id: FunctionId, thread_id: ThreadId) {
        self.registry.record_enter(function_id, thread_id, self.now());
    }

    /// Enter hook with access to the call's arguments, tags the event with
    /// the receiver's surrogate id when one can be resolved
    pub fn on_function_enter_with_args(
        &self,
        function_id: FunctionId,
        thread_id: ThreadId,
        args: &dyn ArgumentSource,
    ) {
        let receiver = self.objects.try_resolve_receiver(function_id, args);
        self.registry
            .record_enter_with_receiver(function_id, thread_id, self.now(), receiver);
    }

    #[inline]
    pub fn on_function_leave(&self, function_id: FunctionId, thread_id: ThreadId) {
        self.registry.record_leave(function_id, thread_id, self.now());
    }

    /// A tail call leaves the caller's frame, so it is recorded as a finish
    #[inline]
    pub fn on_function_tail_call(&self, function_id: FunctionId, thread_id: ThreadId) {
        self.registry.record_leave(function_id, thread_id, self.now());
    }

    #[inline]
    pub fn on_exception_catcher_enter(&self, function_id: FunctionId, thread_id: ThreadId) {
        self.registry
            .record_exception_catch_enter(function_id, thread_id, self.now());
    }

    pub fn on_object_allocated(&self, raw_address: u64) -> SurrogateId {
        self.objects.on_allocation(raw_address)
    }

    pub fn on_objects_relocated(&self, ranges: &[RelocatedRange]) {
        self.objects.on_objects_relocated(ranges);
    }

    pub fn is_shut_down(&self) -> bool {
        self.report.get().is_some()
    }

    /// Stop recording, drain producers and run the serializer once
    ///
    /// Later calls return the first report without doing anything.
    pub fn shutdown(&self) -> &ShutdownReport {
        self.report.get_or_init(|| self.run_shutdown())
    }

    fn run_shutdown(&self) -> ShutdownReport {
        let drain = self.guard.drain();
        self.build_report(drain)
    }

    fn build_report(&self, drain: DrainStats) -> ShutdownReport {
        let mut report = ShutdownReport {
            serializer: self.serializer.name(),
            drain_rounds: drain.polling_rounds,
            drain_elapsed: drain.elapsed,
            threads: 0,
            events_captured: 0,
            outcome: SerializeOutcome::Skipped,
        };

        let snapshot = match self.registry.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Could not freeze shadow stacks");
                report.outcome = SerializeOutcome::Failed(e.to_string());
                return report;
            }
        };
        report.threads = snapshot.thread_count();
        report.events_captured = snapshot.total_events();

        if !self.serializer.is_enabled() {
            tracing::warn!(
                serializer = report.serializer,
                "Serializer is disabled, captured shadow stacks are discarded"
            );
            return report;
        }

        report.outcome = match self.serializer.serialize(&snapshot) {
            Ok(stats) => SerializeOutcome::Written(stats),
            Err(e) => {
                tracing::error!(serializer = report.serializer, error = %e, "Serialization failed");
                SerializeOutcome::Failed(e.to_string())
            }
        };
        report
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("serializer", &self.serializer.kind())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
