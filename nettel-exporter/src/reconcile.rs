//! Conversion of resettable upstream counters into monotonic local deltas.
//!
//! The exported counters only support adding, so every observation of an
//! upstream absolute value is turned into a non-negative delta. A decrease
//! means the upstream counter was reset; the new absolute value is then
//! treated as counted from zero, which undercounts once per reset and never
//! compounds.

use std::collections::BTreeMap;

use crate::enumerator::InterfaceId;
use crate::metrics::TrackedMetric;

/// How an observation relates to the previously tracked value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Growth,
    Reset,
    Unchanged,
}

/// Result of reconciling one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Value to store as the last known upstream value.
    pub tracked: u64,
    /// Amount to add to the exported counter.
    pub delta: u64,
    pub outcome: Outcome,
}

/// Reconcile a new upstream value `curr` against the tracked value `prev`.
pub fn reconcile(prev: u64, curr: u64) -> Reconciled {
    match curr.checked_sub(prev) {
        Some(0) => Reconciled {
            tracked: curr,
            delta: 0,
            outcome: Outcome::Unchanged,
        },
        Some(delta) => Reconciled {
            tracked: curr,
            delta,
            outcome: Outcome::Growth,
        },
        None => Reconciled {
            tracked: curr,
            delta: curr,
            outcome: Outcome::Reset,
        },
    }
}

/// Last known upstream value per (metric, interface).
///
/// Every pair is present from construction; entries are only ever updated.
#[derive(Debug, Clone, Default)]
pub struct TrackedState {
    values: BTreeMap<(TrackedMetric, InterfaceId), u64>,
}

impl TrackedState {
    /// Create state with a zero entry for every metric/interface pair.
    pub fn new(metrics: &[TrackedMetric], interfaces: &[InterfaceId]) -> Self {
        let values = metrics
            .iter()
            .flat_map(|m| interfaces.iter().map(move |i| ((*m, *i), 0)))
            .collect();
        Self { values }
    }

    /// Last known value, `None` if the pair is not tracked.
    pub fn get(&self, metric: TrackedMetric, interface: InterfaceId) -> Option<u64> {
        self.values.get(&(metric, interface)).copied()
    }

    /// Reconcile `observed` against the stored value and store the result.
    ///
    /// Returns `None` and leaves the state untouched for untracked pairs.
    pub fn apply(
        &mut self,
        metric: TrackedMetric,
        interface: InterfaceId,
        observed: u64,
    ) -> Option<Reconciled> {
        let slot = self.values.get_mut(&(metric, interface))?;
        let result = reconcile(*slot, observed);
        *slot = result.tracked;
        Some(result)
    }

    /// Number of tracked pairs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
