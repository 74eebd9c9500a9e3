//! Captured event value types
//!
//! One `TraceEvent` is produced per enter/leave/tail-call/catch notification.
//! Events are immutable once created and owned by the thread buffer they are
//! appended to.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Opaque host function handle
pub type FunctionId = u64;

/// Host logical thread identifier
pub type ThreadId = u64;

/// Stable substitute for a transient object address
pub type SurrogateId = u64;

/// Whether a call event opens or closes a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionEventKind {
    Started,
    Finished,
}

/// Method enter or leave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    pub function_id: FunctionId,
    pub kind: FunctionEventKind,
    pub timestamp: i64,
    /// Surrogate id of the `this` object, when it could be correlated
    pub receiver: Option<SurrogateId>,
}

/// Exception handling entered a catch clause in `function_id`'s frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionCatchEvent {
    pub function_id: FunctionId,
    pub timestamp: i64,
}

/// Anything stored in a thread's event buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEvent {
    Call(CallEvent),
    ExceptionCatch(ExceptionCatchEvent),
}

impl TraceEvent {
    pub fn started(function_id: FunctionId, timestamp: i64) -> Self {
        TraceEvent::Call(CallEvent {
            function_id,
            kind: FunctionEventKind::Started,
            timestamp,
            receiver: None,
        })
    }

    pub fn finished(function_id: FunctionId, timestamp: i64) -> Self {
        TraceEvent::Call(CallEvent {
            function_id,
            kind: FunctionEventKind::Finished,
            timestamp,
            receiver: None,
        })
    }

    pub fn exception_catch(function_id: FunctionId, timestamp: i64) -> Self {
        TraceEvent::ExceptionCatch(ExceptionCatchEvent {
            function_id,
            timestamp,
        })
    }

    pub fn function_id(&self) -> FunctionId {
        match self {
            TraceEvent::Call(call) => call.function_id,
            TraceEvent::ExceptionCatch(catch) => catch.function_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            TraceEvent::Call(call) => call.timestamp,
            TraceEvent::ExceptionCatch(catch) => catch.timestamp,
        }
    }

    pub fn tag(&self) -> EventTag {
        match self {
            TraceEvent::Call(CallEvent {
                kind: FunctionEventKind::Started,
                ..
            }) => EventTag::Started,
            TraceEvent::Call(CallEvent {
                kind: FunctionEventKind::Finished,
                ..
            }) => EventTag::Finished,
            TraceEvent::ExceptionCatch(_) => EventTag::ExceptionCatchEnter,
        }
    }
}

/// One-byte discriminant used by the binary capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventTag {
    Started = 0,
    Finished = 1,
    ExceptionCatchEnter = 2,
}

impl EventTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EventTag::Started),
            1 => Some(EventTag::Finished),
            2 => Some(EventTag::ExceptionCatchEnter),
            _ => None,
        }
    }

    /// Rebuild the event this tag was written for
    pub fn to_event(self, function_id: FunctionId, timestamp: i64) -> TraceEvent {
        match self {
            EventTag::Started => TraceEvent::started(function_id, timestamp),
            EventTag::Finished => TraceEvent::finished(function_id, timestamp),
            EventTag::ExceptionCatchEnter => TraceEvent::exception_catch(function_id, timestamp),
        }
    }
}

/// Monotonic nanosecond clock anchored at session start
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the clock was created
    pub fn now(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
