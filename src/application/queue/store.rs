//! Domain queues for charge point data and status
//!
//! One coarse lock guards all five collections so routing decisions
//! (is this id waiting for its add?) and swaps see a consistent state.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::domain::{ChargePointId, ChargePointSnapshot, StatusUpdate};
use crate::shared::AdapterError;

/// Where a status update was routed on enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRoute {
    Fast,
    /// Held back until the charge point's add has been submitted
    Delayed,
}

/// What an update enqueue did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRoute {
    Queued,
    /// The charge point is still waiting for its add; the add now carries this snapshot
    MergedIntoAdd,
    /// The charge point is scheduled for removal
    Ignored,
}

/// Contents captured by a full-sync swap
#[derive(Debug, Default)]
pub struct FullSyncBatch {
    pub adds: Vec<ChargePointSnapshot>,
    pub updates: Vec<ChargePointSnapshot>,
    pub delayed_statuses: Vec<StatusUpdate>,
    pub removals: Vec<ChargePointId>,
}

impl FullSyncBatch {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty()
            && self.updates.is_empty()
            && self.delayed_statuses.is_empty()
            && self.removals.is_empty()
    }
}

/// Result of a fast-status swap
#[derive(Debug, Default)]
pub struct FastStatusBatch {
    /// Ready to submit
    pub ready: Vec<StatusUpdate>,
    /// Ids that entered the add queue after their status was enqueued
    pub redirected: usize,
}

/// Pending entry counts per queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub to_add: usize,
    pub to_update: usize,
    pub to_remove: usize,
    pub status_fast: usize,
    pub status_delayed: usize,
    pub cdrs: usize,
}

/// The five domain collections
#[derive(Debug, Default)]
pub struct QueueSet {
    to_add: BTreeMap<ChargePointId, ChargePointSnapshot>,
    to_update: BTreeMap<ChargePointId, ChargePointSnapshot>,
    to_remove: BTreeSet<ChargePointId>,
    status_fast: Vec<StatusUpdate>,
    status_delayed: Vec<StatusUpdate>,
    /// Adds swapped out but not yet submitted
    adds_in_flight: BTreeSet<ChargePointId>,
}

impl QueueSet {
    pub fn enqueue_add(&mut self, snapshot: ChargePointSnapshot) {
        self.to_remove.remove(&snapshot.id);
        self.to_update.remove(&snapshot.id);
        self.to_add.insert(snapshot.id.clone(), snapshot);
    }

    pub fn enqueue_update(&mut self, snapshot: ChargePointSnapshot) -> UpdateRoute {
        if self.to_remove.contains(&snapshot.id) {
            return UpdateRoute::Ignored;
        }
        if let Some(pending) = self.to_add.get_mut(&snapshot.id) {
            *pending = snapshot;
            return UpdateRoute::MergedIntoAdd;
        }
        self.to_update.insert(snapshot.id.clone(), snapshot);
        UpdateRoute::Queued
    }

    pub fn enqueue_remove(&mut self, id: ChargePointId) {
        self.to_add.remove(&id);
        self.to_update.remove(&id);
        self.to_remove.insert(id);
    }

    pub fn enqueue_status(&mut self, update: StatusUpdate) -> StatusRoute {
        if self.awaits_add(&update.charge_point_id) {
            self.status_delayed.push(update);
            StatusRoute::Delayed
        } else {
            self.status_fast.push(update);
            StatusRoute::Fast
        }
    }

    /// The id's static data has not been submitted upstream yet.
    pub fn awaits_add(&self, id: &ChargePointId) -> bool {
        self.to_add.contains_key(id) || self.adds_in_flight.contains(id)
    }

    /// Capture and clear add, update, delayed-status and remove queues.
    ///
    /// Captured adds stay "in flight" until [`complete_adds`](Self::complete_adds),
    /// so statuses arriving meanwhile are still delayed. Delayed statuses of
    /// adds already in flight from an earlier swap are left queued.
    pub fn swap_full_sync(&mut self) -> FullSyncBatch {
        let (held, delayed_statuses): (Vec<_>, Vec<_>) = std::mem::take(&mut self.status_delayed)
            .into_iter()
            .partition(|u| self.adds_in_flight.contains(&u.charge_point_id));
        self.status_delayed = held;

        let adds: Vec<ChargePointSnapshot> = std::mem::take(&mut self.to_add).into_values().collect();
        self.adds_in_flight.extend(adds.iter().map(|s| s.id.clone()));

        FullSyncBatch {
            adds,
            updates: std::mem::take(&mut self.to_update).into_values().collect(),
            delayed_statuses,
            removals: std::mem::take(&mut self.to_remove).into_iter().collect(),
        }
    }

    /// Capture and clear the fast status queue.
    ///
    /// Entries whose id started waiting for an add since they were enqueued
    /// are moved to the delayed queue instead.
    pub fn swap_fast(&mut self) -> FastStatusBatch {
        let captured = std::mem::take(&mut self.status_fast);
        let mut batch = FastStatusBatch::default();
        for update in captured {
            if self.awaits_add(&update.charge_point_id) {
                self.status_delayed.push(update);
                batch.redirected += 1;
            } else {
                batch.ready.push(update);
            }
        }
        batch
    }

    /// The add batch containing `ids` has been submitted (whatever the outcome).
    pub fn complete_adds<'a>(&mut self, ids: impl IntoIterator<Item = &'a ChargePointId>) {
        for id in ids {
            self.adds_in_flight.remove(id);
        }
    }

    pub fn has_delayed_statuses(&self) -> bool {
        !self.status_delayed.is_empty()
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth {
            to_add: self.to_add.len(),
            to_update: self.to_update.len(),
            to_remove: self.to_remove.len(),
            status_fast: self.status_fast.len(),
            status_delayed: self.status_delayed.len(),
            cdrs: 0,
        }
    }
}

/// Lock-guarded [`QueueSet`]
#[derive(Debug, Default)]
pub struct QueueStore {
    inner: Mutex<QueueSet>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the queues; waits without bound unless cancelled.
    pub async fn lock(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, QueueSet>, AdapterError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AdapterError::Cancelled),
            guard = self.inner.lock() => Ok(guard),
        }
    }

    /// Release in-flight adds. Not cancellable: skipping it would delay the
    /// ids' statuses forever. Returns whether delayed statuses are still queued.
    pub async fn complete_adds(&self, ids: &[ChargePointId]) -> bool {
        let mut queues = self.inner.lock().await;
        queues.complete_adds(ids);
        queues.has_delayed_statuses()
    }

    pub async fn depth(&self) -> QueueDepth {
        self.inner.lock().await.depth()
    }
}
