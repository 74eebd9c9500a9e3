//! Shutdown coordination between producer threads and the teardown thread
//!
//! Every recording call holds a [`GuardScope`] for its whole duration. The
//! scope bumps an in-flight counter on entry and drops it on every exit path.
//! Teardown raises the shutdown flag and then [`QuiescenceGuard::drain`]s:
//! once that returns no producer is mid-way through a recording call, and the
//! buffers can be handed to a serializer without any lock on the hot path.
//!
//! # Ordering
//!
//! Producers increment the counter *before* checking the flag, and the drain
//! thread sets the flag *before* polling the counter, both with `SeqCst`.
//! A producer that misses the flag is therefore always visible to the drain
//! loop, and a producer that increments after the drain observed zero always
//! sees the flag and backs out without touching any buffer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// First polling interval of [`QuiescenceGuard::drain`]
const DRAIN_INITIAL_BACKOFF: Duration = Duration::from_micros(100);

/// Polling interval ceiling
const DRAIN_MAX_BACKOFF: Duration = Duration::from_millis(10);

/// Global admission switch plus live in-flight counter
#[derive(Debug, Default)]
pub struct QuiescenceGuard {
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
    drained: AtomicBool,
}

impl QuiescenceGuard {
    pub const fn new() -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: AtomicBool::new(false),
        }
    }

    /// Open a scope around one recording call
    ///
    /// Returns `None` once shutdown has begun; the caller must then return
    /// without recording anything.
    #[inline]
    pub fn try_enter(&self) -> Option<GuardScope<'_>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return None;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let scope = GuardScope { guard: self };

        if self.shutting_down.load(Ordering::SeqCst) {
            // dropping the scope releases the slot we just took
            return None;
        }

        Some(scope)
    }

    /// Stop admitting new recording calls. Idempotent.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Number of recording calls currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether a drain has completed
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Wait until no recording call is in flight
    ///
    /// Raises the shutdown flag first if nobody has, so that the counter can
    /// only go down while we poll. Polls with a bounded exponential backoff.
    pub fn drain(&self) -> DrainStats {
        self.begin_shutdown();

        let started = Instant::now();
        let mut rounds = 0u64;
        let mut backoff = DRAIN_INITIAL_BACKOFF;

        while self.in_flight.load(Ordering::SeqCst) != 0 {
            rounds += 1;
            thread::sleep(backoff);
            backoff = (backoff * 2).min(DRAIN_MAX_BACKOFF);
        }

        self.drained.store(true, Ordering::Release);

        let stats = DrainStats {
            polling_rounds: rounds,
            elapsed: started.elapsed(),
        };
        tracing::debug!(
            rounds = stats.polling_rounds,
            elapsed_us = stats.elapsed.as_micros() as u64,
            "Recording calls drained"
        );
        stats
    }
}

/// Outcome of a drain
#[derive(Debug, Clone, Copy)]
pub struct DrainStats {
    /// How many times the drain loop had to sleep
    pub polling_rounds: u64,
    pub elapsed: Duration,
}

/// Held for the duration of one recording call
#[must_use = "the scope releases its in-flight slot when dropped"]
#[derive(Debug)]
pub struct GuardScope<'a> {
    guard: &'a QuiescenceGuard,
}

impl Drop for GuardScope<'_> {
    #[inline]
    fn drop(&mut self) {
        self.guard.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
