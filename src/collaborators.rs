//! Interfaces to the host services the capture core depends on
//!
//! Name resolution, signature inspection and object liveness all live
//! outside this crate. Every lookup is infallible from the caller's point of
//! view: a failed lookup reads as "no name", "no receiver" or "not live".

use crate::event::FunctionId;
use fnv::FnvHashMap;

/// Resolves a function handle to its display name
pub trait NameResolver: Send + Sync {
    /// Returns `None` (or an empty string) when the name cannot be resolved
    fn resolve_name(&self, function_id: FunctionId) -> Option<String>;
}

impl<F> NameResolver for F
where
    F: Fn(FunctionId) -> Option<String> + Send + Sync,
{
    fn resolve_name(&self, function_id: FunctionId) -> Option<String> {
        self(function_id)
    }
}

/// Decides whether a function takes an implicit `this` argument
pub trait SignatureInspector: Send + Sync {
    fn has_receiver(&self, function_id: FunctionId) -> bool;
}

impl<F> SignatureInspector for F
where
    F: Fn(FunctionId) -> bool + Send + Sync,
{
    fn has_receiver(&self, function_id: FunctionId) -> bool {
        self(function_id)
    }
}

/// Confirms that an address still refers to a live managed object
pub trait GenerationLookup: Send + Sync {
    fn is_live(&self, raw_address: u64) -> bool;
}

impl<F> GenerationLookup for F
where
    F: Fn(u64) -> bool + Send + Sync,
{
    fn is_live(&self, raw_address: u64) -> bool {
        self(raw_address)
    }
}

/// Argument layout of an intercepted call
///
/// The host boundary reads the first slot on the core's behalf and hands
/// back a platform-width integer; the core never dereferences memory itself.
pub trait ArgumentSource {
    /// Number of argument ranges the call carries
    fn slot_count(&self) -> usize;

    /// Platform-width value stored in the first argument slot
    fn read_first_slot(&self) -> Option<u64>;
}

/// Argument values already read out by the host boundary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentSlots {
    slots: Vec<u64>,
}

impl ArgumentSlots {
    pub fn new(slots: Vec<u64>) -> Self {
        Self { slots }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl ArgumentSource for ArgumentSlots {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn read_first_slot(&self) -> Option<u64> {
        self.slots.first().copied()
    }
}

/// Fixed name table, used by the demo driver and tests
#[derive(Debug, Clone, Default)]
pub struct StaticNameResolver {
    names: FnvHashMap<FunctionId, String>,
}

impl StaticNameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, function_id: FunctionId, name: impl Into<String>) -> Self {
        self.names.insert(function_id, name.into());
        self
    }

    pub fn insert(&mut self, function_id: FunctionId, name: impl Into<String>) {
        self.names.insert(function_id, name.into());
    }
}

impl NameResolver for StaticNameResolver {
    fn resolve_name(&self, function_id: FunctionId) -> Option<String> {
        self.names.get(&function_id).cloned()
    }
}
