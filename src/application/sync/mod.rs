//! Flush schedulers
//!
//! - [`FullSyncScheduler`]: add/update/remove queues plus delayed statuses
//! - [`FastStatusScheduler`]: status changes not blocked by a pending add
//! - [`StatusRefresher`]: periodic push of every current status, bypassing the queues
//!
//! Each cycle swaps its batch out before the first upstream call; whatever
//! the outcome, swapped items are reported and never re-queued.

pub mod fast_status;
pub mod full_sync;
pub mod status_refresh;

use std::fmt::Display;
use std::time::Duration;

use uuid::Uuid;

use crate::application::queue::QueueDepth;
use crate::domain::PushReport;
use crate::notifications::{CycleEvent, CycleKind, Event, EventBus, PushEvent};
use crate::shared::Clock;

pub use fast_status::{FastStatusScheduler, StatusFlushReport};
pub use full_sync::{FullSyncReport, FullSyncScheduler};
pub use status_refresh::{StatusRefreshReport, StatusRefresher};

/// Publish every report of a cycle plus the cycle summary.
pub(crate) fn publish_cycle<Id: Display>(
    events: &EventBus,
    clock: &dyn Clock,
    cycle_id: Uuid,
    kind: CycleKind,
    reports: &[&PushReport<Id>],
    runtime: Duration,
) {
    let now = clock.now();
    for report in reports {
        events.publish(Event::PushCompleted(PushEvent::from_report(
            report,
            Some(cycle_id),
            now,
        )));
    }
    events.publish(Event::CycleCompleted(CycleEvent {
        cycle_id,
        kind,
        upstream_calls: reports.iter().filter(|r| r.upstream_called).count(),
        runtime_ms: runtime.as_millis() as u64,
        timestamp: now,
    }));
}

pub(crate) fn record_queue_depth(depth: &QueueDepth) {
    let queues = [
        ("to_add", depth.to_add),
        ("to_update", depth.to_update),
        ("to_remove", depth.to_remove),
        ("status_fast", depth.status_fast),
        ("status_delayed", depth.status_delayed),
    ];
    for (queue, len) in queues {
        metrics::gauge!("roaming_queue_depth", "queue" => queue).set(len as f64);
    }
}
