//! Method filtering by display name
//!
//! A filter is configured with an optional regex. Each function id is
//! resolved to its display name once, matched with `Regex::is_match`
//! (unanchored search), and the outcome is memoized for the rest of the
//! process: a function's name never changes, so neither does its decision.
//!
//! Supports:
//! - No pattern: everything is recorded, names are never resolved
//! - Pattern: record only functions whose name matches
//! - Unresolvable name: not recorded
//! - Invalid pattern: logged, filter falls back to recording everything

use crate::collaborators::NameResolver;
use crate::event::FunctionId;
use fnv::FnvHashMap;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Method filter that determines which functions to record
#[derive(Clone)]
pub struct MethodFilter {
    /// Compiled pattern (None = all functions)
    pattern: Option<Regex>,
    resolver: Arc<dyn NameResolver>,
    decisions: Arc<RwLock<FnvHashMap<FunctionId, bool>>>,
}

impl MethodFilter {
    /// Create a filter that records every function
    pub fn all(resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            pattern: None,
            resolver,
            decisions: Arc::default(),
        }
    }

    /// Build a filter from an optional pattern
    ///
    /// Never fails: a pattern that does not compile disables filtering.
    pub fn from_pattern(pattern: Option<&str>, resolver: Arc<dyn NameResolver>) -> Self {
        let pattern = match pattern.map(str::trim).filter(|p| !p.is_empty()) {
            None => None,
            Some(raw) => match Regex::new(raw) {
                Ok(regex) => {
                    tracing::info!(pattern = raw, "Method filter enabled");
                    Some(regex)
                }
                Err(e) => {
                    tracing::error!(
                        pattern = raw,
                        error = %e,
                        "Failed to compile method filter, recording all methods"
                    );
                    None
                }
            },
        };

        Self {
            pattern,
            resolver,
            decisions: Arc::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pattern.is_some()
    }

    /// Same pattern and resolver, empty decision cache
    ///
    /// Serializers take one of these per pass so that a pass's decisions are
    /// shared across all of its threads but not with the live recording path.
    pub fn fresh(&self) -> Self {
        Self {
            pattern: self.pattern.clone(),
            resolver: self.resolver.clone(),
            decisions: Arc::default(),
        }
    }

    /// Check if a function should be recorded
    pub fn should_record(&self, function_id: FunctionId) -> bool {
        let Some(pattern) = &self.pattern else {
            return true;
        };

        if let Some(&cached) = self.read_cache().get(&function_id) {
            return cached;
        }

        // Resolve outside the lock; racing threads may both resolve once, the
        // decision they store is identical.
        let decision = match self.resolver.resolve_name(function_id) {
            Some(name) if !name.is_empty() => pattern.is_match(&name),
            _ => false,
        };

        match self.decisions.write() {
            Ok(mut cache) => {
                cache.insert(function_id, decision);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(function_id, decision);
            }
        }

        decision
    }

    /// Number of memoized decisions
    pub fn cached_decisions(&self) -> usize {
        self.read_cache().len()
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, FnvHashMap<FunctionId, bool>> {
        self.decisions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for MethodFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodFilter")
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("cached_decisions", &self.cached_decisions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticNameResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolver() -> Arc<dyn NameResolver> {
        Arc::new(
            StaticNameResolver::new()
                .with_name(1, "System.Console.WriteLine")
                .with_name(2, "MyApp.Program.Main")
                .with_name(3, "MyApp.Services.OrderService.Place")
                .with_name(4, ""),
        )
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl NameResolver for CountingResolver {
        fn resolve_name(&self, function_id: FunctionId) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(format!("Counted.Method{function_id}"))
        }
    }

    #[test]
    fn test_filter_all_records_everything() {
        let filter = MethodFilter::all(resolver());
        assert!(filter.should_record(1));
        assert!(filter.should_record(999));
        assert!(!filter.is_enabled());
    }

    #[test]
    fn test_filter_pattern_matches_substring() {
        let filter = MethodFilter::from_pattern(Some("MyApp"), resolver());
        assert!(filter.is_enabled());
        assert!(!filter.should_record(1));
        assert!(filter.should_record(2));
        assert!(filter.should_record(3));
    }

    #[test]
    fn test_filter_anchored_pattern() {
        let filter = MethodFilter::from_pattern(Some(r"^MyApp\.Program\."), resolver());
        assert!(filter.should_record(2));
        assert!(!filter.should_record(3));
    }

    #[test]
    fn test_unresolvable_name_is_filtered_out() {
        let filter = MethodFilter::from_pattern(Some(".*"), resolver());
        assert!(!filter.should_record(4));
        assert!(!filter.should_record(12345));
    }

    #[test]
    fn test_invalid_pattern_records_everything() {
        let filter = MethodFilter::from_pattern(Some("MyApp(("), resolver());
        assert!(!filter.is_enabled());
        assert!(filter.should_record(1));
        assert!(filter.should_record(4));
    }

    #[test]
    fn test_empty_pattern_is_disabled() {
        let filter = MethodFilter::from_pattern(Some("   "), resolver());
        assert!(!filter.is_enabled());
    }

    #[test]
    fn test_name_resolved_at_most_once() {
        let counting = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let filter = MethodFilter::from_pattern(Some("Method1"), counting.clone());

        assert!(filter.should_record(1));
        assert!(filter.should_record(1));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        assert!(!filter.should_record(2));
        assert!(!filter.should_record(2));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        assert_eq!(filter.cached_decisions(), 2);
    }

    #[test]
    fn test_disabled_filter_never_resolves() {
        let counting = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let filter = MethodFilter::all(counting.clone());
        assert!(filter.should_record(1));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fresh_filter_has_empty_cache() {
        let filter = MethodFilter::from_pattern(Some("MyApp"), resolver());
        filter.should_record(2);
        let pass = filter.fresh();
        assert_eq!(pass.cached_decisions(), 0);
        assert!(pass.should_record(2));
        assert_eq!(filter.cached_decisions(), 1);
    }

    #[test]
    fn test_filter_debug() {
        let filter = MethodFilter::from_pattern(Some("MyApp"), resolver());
        let debug_str = format!("{:?}", filter);
        assert!(debug_str.contains("MethodFilter"));
        assert!(debug_str.contains("MyApp"));
    }
}
