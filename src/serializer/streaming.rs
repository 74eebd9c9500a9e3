//! Live streaming of call events over a structured transport
//!
//! A small schema is registered up front: one provider and four event types.
//!
//! | Id   | Event                   | Fields                                   |
//! |------|-------------------------|------------------------------------------|
//! | 8000 | `MethodStart`           | Timestamp i64, FunctionId u64, ThreadId u64 |
//! | 8001 | `MethodEnd`             | Timestamp i64, FunctionId u64, ThreadId u64 |
//! | 8002 | `MethodInfo`            | FunctionId u64, FunctionName string      |
//! | 8003 | `ExceptionCatcherEnter` | Timestamp i64, FunctionId u64, ThreadId u64 |
//!
//! In online mode the registry hands every event to
//! [`StreamingSerializer::on_event`], which applies the method filter per
//! call and writes one instance synchronously. `MethodInfo` goes out once per
//! function, the first time it passes the filter, so consumers can name ids
//! without a metadata lookup of their own.

use super::{SerializeStats, ShadowStackSerializer};
use crate::collaborators::NameResolver;
use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::event::{FunctionEventKind, FunctionId, ThreadId, TraceEvent};
use crate::method_filter::MethodFilter;
use crate::shadow_stack::{LiveEventSink, SessionSnapshot};
use crossbeam::channel::{self, Receiver, Sender};
use fnv::FnvHashSet;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

pub const PROVIDER_NAME: &str = "ShadowTraceEventProvider";

pub const METHOD_START_EVENT_ID: u32 = 8000;
pub const METHOD_END_EVENT_ID: u32 = 8001;
pub const METHOD_INFO_EVENT_ID: u32 = 8002;
pub const EXCEPTION_CATCHER_ENTER_EVENT_ID: u32 = 8003;

/// Wire type of one event field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldType {
    Int64,
    UInt64,
    String,
}

/// Named, typed field of an event type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub field_type: FieldType,
}

impl FieldDescriptor {
    const fn new(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type }
    }
}

/// Event type declaration: id, name and ordered fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventDescriptor {
    pub id: u32,
    pub name: &'static str,
    pub fields: Vec<FieldDescriptor>,
}

/// Value of one field in an event instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FieldValue {
    Int64(i64),
    UInt64(u64),
    String(String),
}

impl FieldValue {
    fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::UInt64(_) => FieldType::UInt64,
            FieldValue::String(_) => FieldType::String,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle(pub usize);

/// Live structured-event channel
pub trait EventTransport: Send + Sync {
    fn create_provider(&self, name: &str) -> Result<ProviderHandle>;

    fn define_event(&self, provider: ProviderHandle, descriptor: EventDescriptor) -> Result<EventHandle>;

    /// Values must match the declared fields in order and type
    fn write_event(&self, event: EventHandle, values: Vec<FieldValue>) -> Result<()>;
}

/// Instance delivered by [`ChannelTransport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRecord {
    pub provider: String,
    pub event_id: u32,
    pub event_name: &'static str,
    pub values: Vec<FieldValue>,
}

#[derive(Debug)]
struct DefinedEvent {
    provider: usize,
    provider_name: String,
    descriptor: EventDescriptor,
}

/// In-process transport backed by an unbounded crossbeam channel
#[derive(Debug)]
pub struct ChannelTransport {
    providers: RwLock<Vec<String>>,
    events: RwLock<Vec<DefinedEvent>>,
    sender: Sender<StreamRecord>,
}

impl ChannelTransport {
    /// Create the transport and the receiving end consumers read from
    pub fn new() -> (Self, Receiver<StreamRecord>) {
        let (sender, receiver) = channel::unbounded();
        let transport = Self {
            providers: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            sender,
        };
        (transport, receiver)
    }

    /// Declared event types, in definition order
    pub fn schema(&self) -> Vec<EventDescriptor> {
        self.events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|event| event.descriptor.clone())
            .collect()
    }
}

impl EventTransport for ChannelTransport {
    fn create_provider(&self, name: &str) -> Result<ProviderHandle> {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if providers.iter().any(|p| p == name) {
            return Err(CaptureError::Transport(format!(
                "provider {name} already exists"
            )));
        }
        providers.push(name.to_string());
        Ok(ProviderHandle(providers.len() - 1))
    }

    fn define_event(&self, provider: ProviderHandle, descriptor: EventDescriptor) -> Result<EventHandle> {
        let provider_name = self
            .providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(provider.0)
            .cloned()
            .ok_or_else(|| {
                CaptureError::Transport(format!("unknown provider handle {}", provider.0))
            })?;

        let mut events = self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if events
            .iter()
            .any(|e| e.provider == provider.0 && e.descriptor.id == descriptor.id)
        {
            return Err(CaptureError::Transport(format!(
                "event id {} already defined",
                descriptor.id
            )));
        }
        events.push(DefinedEvent {
            provider: provider.0,
            provider_name,
            descriptor,
        });
        Ok(EventHandle(events.len() - 1))
    }

    fn write_event(&self, event: EventHandle, values: Vec<FieldValue>) -> Result<()> {
        let record = {
            let events = self
                .events
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let defined = events.get(event.0).ok_or_else(|| {
                CaptureError::Transport(format!("unknown event handle {}", event.0))
            })?;

            let fields = &defined.descriptor.fields;
            let matches = fields.len() == values.len()
                && fields
                    .iter()
                    .zip(&values)
                    .all(|(field, value)| field.field_type == value.field_type());
            if !matches {
                return Err(CaptureError::Transport(format!(
                    "payload does not match the fields of {}",
                    defined.descriptor.name
                )));
            }

            StreamRecord {
                provider: defined.provider_name.clone(),
                event_id: defined.descriptor.id,
                event_name: defined.descriptor.name,
                values,
            }
        };

        self.sender
            .send(record)
            .map_err(|_| CaptureError::Transport("stream receiver disconnected".to_string()))
    }
}

/// Stand-in used when no transport was supplied; every call fails
#[derive(Debug)]
struct MissingTransport;

impl EventTransport for MissingTransport {
    fn create_provider(&self, _name: &str) -> Result<ProviderHandle> {
        Err(CaptureError::Transport("no transport configured".to_string()))
    }

    fn define_event(&self, _provider: ProviderHandle, _descriptor: EventDescriptor) -> Result<EventHandle> {
        Err(CaptureError::Transport("no transport configured".to_string()))
    }

    fn write_event(&self, _event: EventHandle, _values: Vec<FieldValue>) -> Result<()> {
        Err(CaptureError::Transport("no transport configured".to_string()))
    }
}

/// Event type set registered by the streaming serializer
pub fn schema(include_thread_id: bool) -> Vec<EventDescriptor> {
    let call_fields = || {
        let mut fields = vec![
            FieldDescriptor::new("Timestamp", FieldType::Int64),
            FieldDescriptor::new("FunctionId", FieldType::UInt64),
        ];
        if include_thread_id {
            fields.push(FieldDescriptor::new("ThreadId", FieldType::UInt64));
        }
        fields
    };

    vec![
        EventDescriptor {
            id: METHOD_START_EVENT_ID,
            name: "MethodStart",
            fields: call_fields(),
        },
        EventDescriptor {
            id: METHOD_END_EVENT_ID,
            name: "MethodEnd",
            fields: call_fields(),
        },
        EventDescriptor {
            id: METHOD_INFO_EVENT_ID,
            name: "MethodInfo",
            fields: vec![
                FieldDescriptor::new("FunctionId", FieldType::UInt64),
                FieldDescriptor::new("FunctionName", FieldType::String),
            ],
        },
        EventDescriptor {
            id: EXCEPTION_CATCHER_ENTER_EVENT_ID,
            name: "ExceptionCatcherEnter",
            fields: call_fields(),
        },
    ]
}

#[derive(Debug, Clone, Copy)]
struct SchemaHandles {
    method_start: EventHandle,
    method_end: EventHandle,
    method_info: EventHandle,
    exception_catcher_enter: EventHandle,
}

/// Instance counts of a streaming serializer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamCounters {
    /// Call and catch events written
    pub events: u64,
    /// `MethodInfo` announcements written
    pub method_info: u64,
    pub filtered: u64,
    /// Writes the transport rejected, announcements included
    pub failed: u64,
}

/// Pushes events to a live transport as they are recorded
pub struct StreamingSerializer {
    transport: Arc<dyn EventTransport>,
    filter: MethodFilter,
    resolver: Arc<dyn NameResolver>,
    include_thread_id: bool,
    handles: OnceLock<Option<SchemaHandles>>,
    announced: RwLock<FnvHashSet<FunctionId>>,
    enabled: AtomicBool,
    written: AtomicU64,
    announced_count: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

impl StreamingSerializer {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        filter: MethodFilter,
        resolver: Arc<dyn NameResolver>,
    ) -> Self {
        Self {
            transport,
            filter,
            resolver,
            include_thread_id: true,
            handles: OnceLock::new(),
            announced: RwLock::new(FnvHashSet::default()),
            enabled: AtomicBool::new(false),
            written: AtomicU64::new(0),
            announced_count: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Serializer with no transport behind it
    ///
    /// Schema registration fails, so it stays disabled and drops every event.
    pub fn without_transport(filter: MethodFilter, resolver: Arc<dyn NameResolver>) -> Self {
        Self::new(Arc::new(MissingTransport), filter, resolver)
    }

    /// Leave the capturing thread id out of call events
    pub fn without_thread_id(mut self) -> Self {
        self.include_thread_id = false;
        self
    }

    /// Declare the provider and event types. Runs once; failure disables streaming.
    pub fn register_schema(&self) {
        let handles = self.handles.get_or_init(|| match self.define_schema() {
            Ok(handles) => {
                tracing::debug!(provider = PROVIDER_NAME, "Streaming schema registered");
                Some(handles)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to register streaming schema, streaming disabled");
                None
            }
        });
        self.enabled.store(handles.is_some(), Ordering::Release);
    }

    fn define_schema(&self) -> Result<SchemaHandles> {
        let provider = self.transport.create_provider(PROVIDER_NAME)?;
        let mut defined = Vec::with_capacity(4);
        for descriptor in schema(self.include_thread_id) {
            defined.push(self.transport.define_event(provider, descriptor)?);
        }

        Ok(SchemaHandles {
            method_start: defined[0],
            method_end: defined[1],
            method_info: defined[2],
            exception_catcher_enter: defined[3],
        })
    }

    pub fn counters(&self) -> StreamCounters {
        StreamCounters {
            events: self.written.load(Ordering::Relaxed),
            method_info: self.announced_count.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn announce(&self, handles: &SchemaHandles, function_id: FunctionId) {
        let known = self
            .announced
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&function_id);
        if known {
            return;
        }

        let first = self
            .announced
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(function_id);
        if !first {
            return;
        }

        let name = self
            .resolver
            .resolve_name(function_id)
            .unwrap_or_default();
        self.emit(
            handles.method_info,
            vec![FieldValue::UInt64(function_id), FieldValue::String(name)],
            &self.announced_count,
        );
    }

    fn emit(&self, handle: EventHandle, values: Vec<FieldValue>, counter: &AtomicU64) {
        match self.transport.write_event(handle, values) {
            Ok(()) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(error = %e, "Dropped streaming event");
            }
        }
    }

    fn push(&self, thread_id: ThreadId, event: &TraceEvent) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        let Some(Some(handles)) = self.handles.get() else {
            return false;
        };

        let function_id = event.function_id();
        if !self.filter.should_record(function_id) {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.announce(handles, function_id);

        let handle = match event {
            TraceEvent::Call(call) => match call.kind {
                FunctionEventKind::Started => handles.method_start,
                FunctionEventKind::Finished => handles.method_end,
            },
            TraceEvent::ExceptionCatch(_) => handles.exception_catcher_enter,
        };

        let mut values = vec![
            FieldValue::Int64(event.timestamp()),
            FieldValue::UInt64(function_id),
        ];
        if self.include_thread_id {
            values.push(FieldValue::UInt64(thread_id));
        }
        self.emit(handle, values, &self.written);
        true
    }
}

impl LiveEventSink for StreamingSerializer {
    fn on_event(&self, thread_id: ThreadId, event: &TraceEvent) {
        self.push(thread_id, event);
    }
}

impl ShadowStackSerializer for StreamingSerializer {
    fn name(&self) -> &'static str {
        "streaming"
    }

    fn init(&mut self, _config: &CaptureConfig) {
        self.register_schema();
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Replay a buffered snapshot through the transport
    ///
    /// Online sessions buffer nothing, so this only has work to do when a
    /// snapshot was captured offline.
    fn serialize(&self, snapshot: &SessionSnapshot) -> Result<SerializeStats> {
        if !self.is_enabled() {
            return Err(CaptureError::SerializerDisabled("streaming"));
        }

        let mut stats = SerializeStats::default();
        for (thread_id, events) in snapshot.threads() {
            let mut written = 0u64;
            for event in events {
                if self.push(thread_id, event) {
                    written += 1;
                }
            }
            stats.absorb(written, events.len() as u64 - written);
        }

        tracing::info!(
            threads = stats.threads,
            written = stats.events_written,
            "Finished replaying shadow stacks to stream"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for StreamingSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSerializer")
            .field("enabled", &self.is_enabled())
            .field("include_thread_id", &self.include_thread_id)
            .field("counters", &self.counters())
            .finish()
    }
}
