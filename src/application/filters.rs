//! Caller-supplied filter strategies
//!
//! Both filters are called while a queue lock may be held, so they must be
//! pure and cheap: no I/O, no blocking, no re-entry into the adapter.

use std::sync::Arc;

use crate::domain::{ChargeDetailRecord, ChargePointId};

/// Decides whether a charge point is propagated upstream at all.
///
/// Returning `false` yields a `Filtered` outcome for add, update, remove and
/// status operations, and skips the id in the periodic refresh.
pub type ChargePointFilter = Arc<dyn Fn(&ChargePointId) -> bool + Send + Sync>;

/// Verdict of a [`CdrFilter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdrFilterDecision {
    Forward,
    /// Never reaches upstream; reported as `Filtered`
    Filter,
}

/// Partitions charge detail records before conversion.
pub type CdrFilter = Arc<dyn Fn(&ChargeDetailRecord) -> CdrFilterDecision + Send + Sync>;

/// Propagate every charge point.
pub fn include_all_charge_points() -> ChargePointFilter {
    Arc::new(|_| true)
}

/// Forward every CDR.
pub fn forward_all_cdrs() -> CdrFilter {
    Arc::new(|_| CdrFilterDecision::Forward)
}
