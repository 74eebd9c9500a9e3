//! Per-thread shadow stack registry
//!
//! Producer threads call `record_*` on every method enter/leave. Each call:
//!
//! 1. opens a [`GuardScope`](crate::quiescence::GuardScope), or returns
//!    immediately if shutdown has begun
//! 2. finds (or lazily creates) the calling thread's buffer
//! 3. appends one event to a lock-free queue owned by that thread
//!
//! The only exclusive section is first-touch buffer creation. After the
//! guard has drained, [`ShadowStackRegistry::snapshot`] freezes every buffer
//! into a [`SessionSnapshot`] for exactly one serializer pass.
//!
//! # Design
//!
//! ```text
//! producer threads (hot path)             teardown thread (cold path)
//! ───────────────────────────             ───────────────────────────
//! record_enter(f, tid, ts)                 guard.begin_shutdown()
//!   guard.try_enter()?                     guard.drain()   // waits in_flight == 0
//!   buffers[tid].push(Started)             registry.snapshot()
//!                                          serializer.serialize(&snapshot)
//! ```

use crate::error::{CaptureError, Result};
use crate::event::{CallEvent, FunctionEventKind, FunctionId, SurrogateId, ThreadId, TraceEvent};
use crate::quiescence::QuiescenceGuard;
use crossbeam::queue::SegQueue;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Buffer the current OS thread appended to last
struct CachedBuffer {
    registry_id: u64,
    thread_id: ThreadId,
    buffer: Weak<ThreadEventBuffer>,
}

thread_local! {
    static LAST_BUFFER: RefCell<Option<CachedBuffer>> = const { RefCell::new(None) };
}

/// Receives every event as it is recorded in online mode
pub trait LiveEventSink: Send + Sync {
    fn on_event(&self, thread_id: ThreadId, event: &TraceEvent);
}

/// Whether events are retained for a bulk pass or pushed live
#[derive(Clone)]
pub enum RecordingMode {
    /// Buffer everything for one serializer pass at shutdown
    Offline,
    /// Forward each event to the sink, retain nothing
    Online(Arc<dyn LiveEventSink>),
}

impl std::fmt::Debug for RecordingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingMode::Offline => f.write_str("Offline"),
            RecordingMode::Online(_) => f.write_str("Online"),
        }
    }
}

/// Append-only event sequence of one logical thread
#[derive(Debug)]
pub struct ThreadEventBuffer {
    thread_id: ThreadId,
    events: SegQueue<TraceEvent>,
    len: AtomicUsize,
}

impl ThreadEventBuffer {
    fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            events: SegQueue::new(),
            len: AtomicUsize::new(0),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Events appended and not yet taken by a snapshot
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn push(&self, event: TraceEvent) {
        self.events.push(event);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Move every buffered event out, in append order
    fn take_all(&self) -> Vec<TraceEvent> {
        let mut events = Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop() {
            events.push(event);
        }
        self.len.fetch_sub(events.len(), Ordering::Relaxed);
        events
    }
}

/// Complete `thread id -> events` mapping handed to a serializer
///
/// Threads are ordered by id; no cross-thread interleaving is implied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    threads: BTreeMap<ThreadId, Vec<TraceEvent>>,
}

impl SessionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot directly, e.g. from a parsed capture file
    pub fn from_threads(threads: impl IntoIterator<Item = (ThreadId, Vec<TraceEvent>)>) -> Self {
        Self {
            threads: threads.into_iter().collect(),
        }
    }

    pub fn threads(&self) -> impl Iterator<Item = (ThreadId, &[TraceEvent])> {
        self.threads.iter().map(|(id, events)| (*id, events.as_slice()))
    }

    pub fn thread(&self, thread_id: ThreadId) -> Option<&[TraceEvent]> {
        self.threads.get(&thread_id).map(Vec::as_slice)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn total_events(&self) -> usize {
        self.threads.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// Central per-thread event store
pub struct ShadowStackRegistry {
    id: u64,
    guard: Arc<QuiescenceGuard>,
    mode: RecordingMode,
    buffers: RwLock<FnvHashMap<ThreadId, Arc<ThreadEventBuffer>>>,
    frozen: OnceLock<Arc<SessionSnapshot>>,
}

impl ShadowStackRegistry {
    pub fn new(guard: Arc<QuiescenceGuard>, mode: RecordingMode) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            guard,
            mode,
            buffers: RwLock::new(FnvHashMap::default()),
            frozen: OnceLock::new(),
        }
    }

    /// Offline registry with its own guard, handy for tests and tools
    pub fn offline() -> Self {
        Self::new(Arc::new(QuiescenceGuard::new()), RecordingMode::Offline)
    }

    pub fn guard(&self) -> &Arc<QuiescenceGuard> {
        &self.guard
    }

    pub fn mode(&self) -> &RecordingMode {
        &self.mode
    }

    #[inline]
    pub fn record_enter(&self, function_id: FunctionId, thread_id: ThreadId, timestamp: i64) {
        self.record(thread_id, TraceEvent::started(function_id, timestamp));
    }

    /// Enter event carrying the receiver's surrogate id
    #[inline]
    pub fn record_enter_with_receiver(
        &self,
        function_id: FunctionId,
        thread_id: ThreadId,
        timestamp: i64,
        receiver: Option<SurrogateId>,
    ) {
        self.record(
            thread_id,
            TraceEvent::Call(CallEvent {
                function_id,
                kind: FunctionEventKind::Started,
                timestamp,
                receiver,
            }),
        );
    }

    #[inline]
    pub fn record_leave(&self, function_id: FunctionId, thread_id: ThreadId, timestamp: i64) {
        self.record(thread_id, TraceEvent::finished(function_id, timestamp));
    }

    #[inline]
    pub fn record_exception_catch_enter(
        &self,
        function_id: FunctionId,
        thread_id: ThreadId,
        timestamp: i64,
    ) {
        self.record(thread_id, TraceEvent::exception_catch(function_id, timestamp));
    }

    /// Handle that caches this thread's buffer across calls
    pub fn thread_recorder(&self, thread_id: ThreadId) -> ThreadRecorder<'_> {
        ThreadRecorder {
            registry: self,
            thread_id,
            buffer: None,
        }
    }

    #[inline]
    fn record(&self, thread_id: ThreadId, event: TraceEvent) {
        let Some(_scope) = self.guard.try_enter() else {
            return;
        };

        match &self.mode {
            RecordingMode::Offline => self.buffer_for(thread_id).push(event),
            RecordingMode::Online(sink) => sink.on_event(thread_id, &event),
        }
    }

    /// Buffer for `thread_id`
    ///
    /// Repeat appends from the same OS thread are served from a thread-local
    /// slot without touching the map lock.
    fn buffer_for(&self, thread_id: ThreadId) -> Arc<ThreadEventBuffer> {
        let cached = LAST_BUFFER
            .try_with(|slot| {
                slot.borrow()
                    .as_ref()
                    .filter(|c| c.registry_id == self.id && c.thread_id == thread_id)
                    .and_then(|c| c.buffer.upgrade())
            })
            .ok()
            .flatten();
        if let Some(buffer) = cached {
            return buffer;
        }

        let buffer = self.lookup_or_create(thread_id);
        let _ = LAST_BUFFER.try_with(|slot| {
            *slot.borrow_mut() = Some(CachedBuffer {
                registry_id: self.id,
                thread_id,
                buffer: Arc::downgrade(&buffer),
            });
        });
        buffer
    }

    /// Existing buffer for `thread_id`, or a new one if this is first touch
    fn lookup_or_create(&self, thread_id: ThreadId) -> Arc<ThreadEventBuffer> {
        {
            let buffers = self
                .buffers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(buffer) = buffers.get(&thread_id) {
                return buffer.clone();
            }
        }

        let mut buffers = self
            .buffers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buffers
            .entry(thread_id)
            .or_insert_with(|| {
                tracing::trace!(thread_id, "Created shadow stack buffer");
                Arc::new(ThreadEventBuffer::new(thread_id))
            })
            .clone()
    }

    /// Number of thread buffers created so far
    pub fn thread_count(&self) -> usize {
        self.buffers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Events currently held in thread buffers
    ///
    /// Drops to zero once [`snapshot`](Self::snapshot) has moved everything
    /// into the frozen snapshot.
    pub fn event_count(&self) -> usize {
        self.buffers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|buffer| buffer.len())
            .sum()
    }

    /// Freeze all buffers into a snapshot
    ///
    /// Only valid once the guard has drained. The first successful call
    /// freezes the buffers; later calls return the same snapshot.
    pub fn snapshot(&self) -> Result<Arc<SessionSnapshot>> {
        if !self.guard.is_drained() {
            return Err(CaptureError::NotQuiescent);
        }

        let snapshot = self.frozen.get_or_init(|| {
            let buffers = self
                .buffers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let snapshot = SessionSnapshot::from_threads(
                buffers
                    .iter()
                    .map(|(thread_id, buffer)| (*thread_id, buffer.take_all())),
            );
            tracing::debug!(
                threads = snapshot.thread_count(),
                events = snapshot.total_events(),
                "Shadow stacks frozen"
            );
            Arc::new(snapshot)
        });

        Ok(snapshot.clone())
    }
}

impl std::fmt::Debug for ShadowStackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowStackRegistry")
            .field("mode", &self.mode)
            .field("threads", &self.thread_count())
            .field("frozen", &self.frozen.get().is_some())
            .finish()
    }
}

/// Per-thread recording handle
///
/// Looks the thread's buffer up once and reuses it afterwards. Meant to be
/// owned by the producer thread it was created for.
pub struct ThreadRecorder<'a> {
    registry: &'a ShadowStackRegistry,
    thread_id: ThreadId,
    buffer: Option<Arc<ThreadEventBuffer>>,
}

impl ThreadRecorder<'_> {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    #[inline]
    pub fn enter(&mut self, function_id: FunctionId, timestamp: i64) {
        self.record(TraceEvent::started(function_id, timestamp));
    }

    #[inline]
    pub fn leave(&mut self, function_id: FunctionId, timestamp: i64) {
        self.record(TraceEvent::finished(function_id, timestamp));
    }

    #[inline]
    pub fn exception_catch_enter(&mut self, function_id: FunctionId, timestamp: i64) {
        self.record(TraceEvent::exception_catch(function_id, timestamp));
    }

    fn record(&mut self, event: TraceEvent) {
        let Some(_scope) = self.registry.guard.try_enter() else {
            return;
        };

        match &self.registry.mode {
            RecordingMode::Offline => {
                let registry = self.registry;
                let thread_id = self.thread_id;
                self.buffer
                    .get_or_insert_with(|| registry.buffer_for(thread_id))
                    .push(event);
            }
            RecordingMode::Online(sink) => sink.on_event(self.thread_id, &event),
        }
    }
}
