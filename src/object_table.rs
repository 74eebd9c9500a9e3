//! Object correlation: raw object addresses to stable surrogate ids
//!
//! Every observed allocation gets the next value of a process-wide counter.
//! At call time the receiver address read from the first argument slot is
//! translated back through this table, so call events can carry a `this`
//! identity that survives beyond the object's address.
//!
//! # Known limitation
//!
//! Entries are keyed by raw address and relocation notifications are ignored.
//! After the host compacts its heap an address may map to a stale id, or to
//! the id of a different object that moved into the old slot.

use crate::collaborators::{ArgumentSource, GenerationLookup, SignatureInspector};
use crate::event::{FunctionId, SurrogateId};
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// First surrogate id handed out
const FIRST_SURROGATE_ID: SurrogateId = 1;

/// One contiguous block moved by the host allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocatedRange {
    pub old_start: u64,
    pub new_start: u64,
    pub length: u64,
}

/// Maps transient object addresses to surrogate ids
pub struct ObjectCorrelationTable {
    next_id: AtomicU64,
    entries: Mutex<FnvHashMap<u64, SurrogateId>>,
    signatures: Arc<dyn SignatureInspector>,
    generations: Arc<dyn GenerationLookup>,
}

impl ObjectCorrelationTable {
    pub fn new(
        signatures: Arc<dyn SignatureInspector>,
        generations: Arc<dyn GenerationLookup>,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(FIRST_SURROGATE_ID),
            entries: Mutex::new(FnvHashMap::default()),
            signatures,
            generations,
        }
    }

    /// Record an allocation and return the id assigned to it
    ///
    /// A later allocation at the same address is a new logical object and
    /// replaces the earlier entry with a fresh id.
    pub fn on_allocation(&self, raw_address: u64) -> SurrogateId {
        let mut entries = self.lock_entries();
        // taken under the lock so table order matches id order
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(raw_address, id);
        id
    }

    /// Surrogate id currently assigned to `raw_address`
    pub fn lookup(&self, raw_address: u64) -> Option<SurrogateId> {
        self.lock_entries().get(&raw_address).copied()
    }

    /// Translate the receiver of an intercepted call into its surrogate id
    ///
    /// Returns `None` when the call has no arguments, the function is not an
    /// instance method, the receiver is not confirmed live, or the receiver
    /// was never observed being allocated.
    pub fn try_resolve_receiver(
        &self,
        function_id: FunctionId,
        args: &dyn ArgumentSource,
    ) -> Option<SurrogateId> {
        if args.slot_count() == 0 {
            return None;
        }

        if !self.signatures.has_receiver(function_id) {
            return None;
        }

        let receiver = args.read_first_slot()?;
        if !self.generations.is_live(receiver) {
            return None;
        }

        self.lookup(receiver)
    }

    /// Heap compaction notification. Intentionally leaves the table untouched.
    pub fn on_objects_relocated(&self, ranges: &[RelocatedRange]) {
        tracing::trace!(
            ranges = ranges.len(),
            "Objects relocated, surrogate ids keyed by old addresses are kept"
        );
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> MutexGuard<'_, FnvHashMap<u64, SurrogateId>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ObjectCorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCorrelationTable")
            .field("entries", &self.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ArgumentSlots;
    use std::collections::HashSet;
    use std::thread;

    fn table() -> ObjectCorrelationTable {
        // even function ids are instance methods, address 0xdead is collected
        ObjectCorrelationTable::new(
            Arc::new(|id: FunctionId| id % 2 == 0),
            Arc::new(|addr: u64| addr != 0xdead),
        )
    }

    #[test]
    fn test_ids_strictly_increase() {
        let table = table();
        let a = table.on_allocation(0x1000);
        let b = table.on_allocation(0x2000);
        let c = table.on_allocation(0x3000);
        assert_eq!(a, FIRST_SURROGATE_ID);
        assert!(a < b && b < c);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_reallocation_at_same_address_gets_new_id() {
        let table = table();
        let first = table.on_allocation(0x1000);
        let second = table.on_allocation(0x1000);
        assert!(second > first);
        assert_eq!(table.lookup(0x1000), Some(second));
    }

    #[test]
    fn test_concurrent_allocations_never_share_ids() {
        let table = Arc::new(table());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..500u64)
                        .map(|i| table.on_allocation((t << 32) | (i * 16)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id), "id {id} issued twice");
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(table.len(), 4000);
    }

    #[test]
    fn test_resolve_receiver_of_instance_method() {
        let table = table();
        let id = table.on_allocation(0x4000);
        let args = ArgumentSlots::new(vec![0x4000, 7]);
        assert_eq!(table.try_resolve_receiver(2, &args), Some(id));
    }

    #[test]
    fn test_resolve_receiver_rejections() {
        let table = table();
        table.on_allocation(0x4000);
        table.on_allocation(0xdead);

        // no arguments
        assert_eq!(table.try_resolve_receiver(2, &ArgumentSlots::empty()), None);
        // static method
        let args = ArgumentSlots::new(vec![0x4000]);
        assert_eq!(table.try_resolve_receiver(3, &args), None);
        // receiver not live
        let dead = ArgumentSlots::new(vec![0xdead]);
        assert_eq!(table.try_resolve_receiver(2, &dead), None);
        // never allocated
        let unknown = ArgumentSlots::new(vec![0x9999]);
        assert_eq!(table.try_resolve_receiver(2, &unknown), None);
    }

    #[test]
    fn test_relocation_is_a_no_op() {
        let table = table();
        let id = table.on_allocation(0x1000);
        table.on_objects_relocated(&[RelocatedRange {
            old_start: 0x1000,
            new_start: 0x8000,
            length: 64,
        }]);
        assert_eq!(table.lookup(0x1000), Some(id));
        assert_eq!(table.lookup(0x8000), None);
    }
}
