//! The core never publishes metrics itself; per the §9 "mutable shared
//! statistics class" redesign note it calls into a small interface instead,
//! and a no-op implementation must always be usable.

/// A metrics sink the map calls into. Implementations typically forward to
/// whatever metrics system the embedding application already uses.
pub trait MapStatistics: Send + Sync {
    /// Increment a named counter by `delta`.
    fn counter(&self, name: &str, delta: u64);

    /// Record an observation (e.g. a latency in microseconds) under `name`.
    fn observe(&self, name: &str, value: f64);
}

/// A `MapStatistics` that discards everything. The default for
/// [`crate::config::VirtualMapConfig`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatistics;

impl MapStatistics for NoopStatistics {
    fn counter(&self, _name: &str, _delta: u64) {}
    fn observe(&self, _name: &str, _value: f64) {}
}
