//! Full-sync cycle
//!
//! Swaps add, update, delayed-status and remove queues in one step and
//! submits: adds (a full list replace on the first submission since start),
//! then the remaining updates, then statuses. Each submission is independent;
//! one failing does not keep the others from being sent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{publish_cycle, record_queue_depth};
use crate::application::queue::{FlushTimer, FullSyncBatch, QueueStore};
use crate::application::upstream::UpstreamFacade;
use crate::config::FeatureToggles;
use crate::domain::{
    latest_per_charge_point, ChargePointId, FlushCycleResult, ItemResult, PushOperation,
    PushOutcome, PushReport, StatusUpdate,
};
use crate::notifications::{CycleKind, SharedEventBus};
use crate::shared::{AdapterError, SharedClock};

/// Removal is drained but not wired to an upstream operation.
pub const REMOVAL_NOT_PROPAGATED: &str = "removal is not propagated upstream";

/// Everything one full-sync cycle did
#[derive(Debug, Clone)]
pub struct FullSyncReport {
    pub cycle_id: Uuid,
    pub adds: Option<PushReport<ChargePointId>>,
    pub updates: Option<PushReport<ChargePointId>>,
    pub statuses: Option<PushReport<ChargePointId>>,
    pub removals: Option<PushReport<ChargePointId>>,
    /// Updates dropped because the same cycle adds the charge point
    pub dropped_updates: usize,
    pub runtime: Duration,
}

impl FullSyncReport {
    fn empty(cycle_id: Uuid) -> Self {
        Self {
            cycle_id,
            adds: None,
            updates: None,
            statuses: None,
            removals: None,
            dropped_updates: 0,
            runtime: Duration::ZERO,
        }
    }

    pub fn reports(&self) -> Vec<&PushReport<ChargePointId>> {
        [&self.adds, &self.updates, &self.statuses, &self.removals]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn upstream_calls(&self) -> usize {
        self.reports().iter().filter(|r| r.upstream_called).count()
    }

    pub fn is_noop(&self) -> bool {
        self.reports().is_empty()
    }
}

pub struct FullSyncScheduler {
    queues: Arc<QueueStore>,
    facade: Arc<UpstreamFacade>,
    events: SharedEventBus,
    clock: SharedClock,
    timer: Arc<FlushTimer>,
    push_status_enabled: bool,
    push_data_enabled: bool,
    list_replaced: AtomicBool,
    /// Held for a whole cycle; the add-before-status order relies on it
    cycle: Mutex<()>,
}

impl FullSyncScheduler {
    pub fn new(
        queues: Arc<QueueStore>,
        facade: Arc<UpstreamFacade>,
        events: SharedEventBus,
        clock: SharedClock,
        timer: Arc<FlushTimer>,
        features: &FeatureToggles,
    ) -> Self {
        Self {
            queues,
            facade,
            events,
            clock,
            timer,
            push_data_enabled: !features.disable_push_data,
            push_status_enabled: !features.disable_push_status,
            list_replaced: AtomicBool::new(false),
            cycle: Mutex::new(()),
        }
    }

    pub fn timer(&self) -> &Arc<FlushTimer> {
        &self.timer
    }

    /// Run one cycle. Fails only if cancelled before the queues were swapped.
    ///
    /// Cycles never overlap: a second caller waits for the running one.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<FullSyncReport, AdapterError> {
        let _cycle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            guard = self.cycle.lock() => guard,
        };
        let started = Instant::now();
        let cycle_id = Uuid::new_v4();
        self.timer.disarm();

        let batch = {
            let mut queues = self.queues.lock(cancel).await?;
            let batch = queues.swap_full_sync();
            record_queue_depth(&queues.depth());
            batch
        };

        if batch.is_empty() {
            debug!(%cycle_id, "Full sync: nothing queued");
            return Ok(FullSyncReport::empty(cycle_id));
        }

        let FullSyncBatch {
            adds,
            updates,
            delayed_statuses,
            removals,
        } = batch;

        info!(
            %cycle_id,
            adds = adds.len(),
            updates = updates.len(),
            delayed_statuses = delayed_statuses.len(),
            removals = removals.len(),
            "Full sync cycle started"
        );

        let mut report = FullSyncReport::empty(cycle_id);

        // Every fresh charge point gets its initial status sent
        let mut statuses: Vec<StatusUpdate> = adds.iter().map(StatusUpdate::initial).collect();
        statuses.extend(delayed_statuses);

        let added: HashSet<&ChargePointId> = adds.iter().map(|s| &s.id).collect();
        let before = updates.len();
        let updates: Vec<_> = updates
            .into_iter()
            .filter(|u| !added.contains(&u.id))
            .collect();
        report.dropped_updates = before - updates.len();
        if report.dropped_updates > 0 {
            debug!(%cycle_id, dropped = report.dropped_updates, "Dropped updates duplicated by adds");
        }

        if !adds.is_empty() {
            let add_ids: Vec<ChargePointId> = adds.iter().map(|s| s.id.clone()).collect();
            let add_report = if !self.push_data_enabled {
                admin_down(PushOperation::UpdateChargePoints, &add_ids)
            } else if !self.list_replaced.swap(true, Ordering::SeqCst) {
                self.facade.replace_charge_points(adds, cancel).await
            } else {
                self.facade.update_charge_points(adds, cancel).await
            };
            if self.queues.complete_adds(&add_ids).await {
                self.timer.arm(Duration::ZERO);
            }
            report.adds = Some(add_report);
        }

        if !updates.is_empty() {
            report.updates = Some(if self.push_data_enabled {
                self.facade.update_charge_points(updates, cancel).await
            } else {
                let ids: Vec<_> = updates.into_iter().map(|s| s.id).collect();
                admin_down(PushOperation::UpdateChargePoints, &ids)
            });
        }

        if !statuses.is_empty() {
            let latest = latest_per_charge_point(statuses);
            report.statuses = Some(if self.push_status_enabled {
                let records = latest.iter().map(StatusUpdate::to_record).collect();
                self.facade
                    .update_status(PushOperation::UpdateStatus, records, None, cancel)
                    .await
            } else {
                let ids: Vec<_> = latest.into_iter().map(|s| s.charge_point_id).collect();
                admin_down(PushOperation::UpdateStatus, &ids)
            });
        }

        if !removals.is_empty() {
            warn!(%cycle_id, removals = removals.len(), "Drained removals; {}", REMOVAL_NOT_PROPAGATED);
            let items = removals
                .into_iter()
                .map(|id| {
                    ItemResult::new(id, PushOutcome::NoOperation)
                        .with_warning(REMOVAL_NOT_PROPAGATED)
                })
                .collect();
            report.removals = Some(PushReport::local(
                PushOperation::RemoveChargePoints,
                FlushCycleResult::NoOperation,
                items,
            ));
        }

        report.runtime = started.elapsed();
        publish_cycle(
            &self.events,
            self.clock.as_ref(),
            cycle_id,
            CycleKind::FullSync,
            &report.reports(),
            report.runtime,
        );
        info!(
            %cycle_id,
            upstream_calls = report.upstream_calls(),
            runtime_ms = report.runtime.as_millis() as u64,
            "Full sync cycle finished"
        );

        Ok(report)
    }
}

fn admin_down(operation: PushOperation, ids: &[ChargePointId]) -> PushReport<ChargePointId> {
    PushReport::local(
        operation,
        FlushCycleResult::AdminDown,
        ids.iter().cloned().map(ItemResult::admin_down).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{TransportError, UpstreamResponse};
    use crate::application::queue::StatusRoute;
    use crate::application::testing::{FakeRoamingClient, RecordedCall};
    use crate::domain::{ChargePointSnapshot, ChargePointStatus};
    use crate::notifications::{create_event_bus, Event};
    use crate::shared::ManualClock;
    use chrono::{TimeZone, Utc};

    struct Harness {
        client: Arc<FakeRoamingClient>,
        queues: Arc<QueueStore>,
        scheduler: Arc<FullSyncScheduler>,
        events: SharedEventBus,
    }

    fn harness(features: FeatureToggles) -> Harness {
        let client = Arc::new(FakeRoamingClient::new());
        let queues = Arc::new(QueueStore::new());
        let events = create_event_bus();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let scheduler = Arc::new(FullSyncScheduler::new(
            queues.clone(),
            Arc::new(UpstreamFacade::new(client.clone(), Duration::from_secs(5))),
            events.clone(),
            clock,
            Arc::new(FlushTimer::new("full_sync")),
            &features,
        ));
        Harness { client, queues, scheduler, events }
    }

    fn snapshot(id: &str, status: ChargePointStatus) -> ChargePointSnapshot {
        ChargePointSnapshot::new(id, status, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap())
    }

    fn status(id: &str, new_status: ChargePointStatus, minute: u32) -> StatusUpdate {
        StatusUpdate::new(
            id,
            ChargePointStatus::Unknown,
            new_status,
            Utc.with_ymd_and_hms(2024, 5, 1, 11, minute, 0).unwrap(),
        )
    }

    fn ids(list: &[&str]) -> Vec<ChargePointId> {
        list.iter().map(|s| ChargePointId::from(*s)).collect()
    }

    #[tokio::test]
    async fn empty_queues_make_no_upstream_calls() {
        let h = harness(FeatureToggles::default());
        let report = h.scheduler.run(&CancellationToken::new()).await.unwrap();

        assert!(report.is_noop());
        assert_eq!(report.upstream_calls(), 0);
        assert_eq!(h.client.call_count(), 0);
    }

    #[tokio::test]
    async fn add_then_status_goes_through_delayed_path() {
        let h = harness(FeatureToggles::default());
        {
            let mut queues = h.queues.lock(&CancellationToken::new()).await.unwrap();
            queues.enqueue_add(snapshot("evseA", ChargePointStatus::Unknown));
            let route = queues.enqueue_status(status("evseA", ChargePointStatus::Available, 30));
            assert_eq!(route, StatusRoute::Delayed);
        }

        let report = h.scheduler.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            h.client.calls(),
            vec![
                RecordedCall::Replace(ids(&["evseA"])),
                RecordedCall::Status { ids: ids(&["evseA"]), ttl: None },
            ]
        );
        assert_eq!(report.upstream_calls(), 2);
        assert_eq!(h.queues.depth().await.status_fast, 0);
    }

    #[tokio::test]
    async fn overlapping_cycles_keep_status_behind_its_add() {
        let h = harness(FeatureToggles::default());
        let cancel = CancellationToken::new();
        h.queues.lock(&cancel).await.unwrap().enqueue_add(snapshot("X", ChargePointStatus::Unknown));

        let gate = h.client.hold_calls();
        let spawn_cycle = || {
            let scheduler = h.scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(&cancel).await })
        };

        let first = spawn_cycle();
        h.client.wait_for_calls(1).await;

        let route = h
            .queues
            .lock(&cancel)
            .await
            .unwrap()
            .enqueue_status(status("X", ChargePointStatus::Occupied, 40));
        assert_eq!(route, StatusRoute::Delayed);

        let second = spawn_cycle();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.client.calls(), vec![RecordedCall::Replace(ids(&["X"]))]);

        drop(gate);
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first.adds.unwrap().result, FlushCycleResult::Success);
        assert_eq!(second.statuses.unwrap().result, FlushCycleResult::Success);
        assert_eq!(
            h.client.calls(),
            vec![
                RecordedCall::Replace(ids(&["X"])),
                RecordedCall::Status { ids: ids(&["X"]), ttl: None },
                RecordedCall::Status { ids: ids(&["X"]), ttl: None },
            ]
        );
    }

    #[tokio::test]
    async fn first_add_batch_replaces_later_ones_update() {
        let h = harness(FeatureToggles::default());
        let cancel = CancellationToken::new();

        h.queues.lock(&cancel).await.unwrap().enqueue_add(snapshot("A", ChargePointStatus::Available));
        h.scheduler.run(&cancel).await.unwrap();

        h.queues.lock(&cancel).await.unwrap().enqueue_add(snapshot("B", ChargePointStatus::Available));
        h.scheduler.run(&cancel).await.unwrap();

        let calls = h.client.calls();
        assert_eq!(calls[0], RecordedCall::Replace(ids(&["A"])));
        assert_eq!(calls[2], RecordedCall::Update(ids(&["B"])));
    }

    #[tokio::test]
    async fn synthesized_status_loses_to_newer_change() {
        let h = harness(FeatureToggles::default());
        let cancel = CancellationToken::new();
        {
            let mut queues = h.queues.lock(&cancel).await.unwrap();
            queues.enqueue_add(snapshot("A", ChargePointStatus::Available));
            queues.enqueue_status(status("A", ChargePointStatus::Occupied, 45));
        }

        let report = h.scheduler.run(&cancel).await.unwrap();
        let statuses = report.statuses.unwrap();
        assert_eq!(statuses.items.len(), 1);
        assert_eq!(statuses.result, FlushCycleResult::Success);
    }

    #[tokio::test]
    async fn failed_add_does_not_block_updates_or_statuses() {
        let h = harness(FeatureToggles::default());
        let cancel = CancellationToken::new();
        h.client.respond_next_data(Err(TransportError::Connection("reset by peer".into())));
        {
            let mut queues = h.queues.lock(&cancel).await.unwrap();
            queues.enqueue_add(snapshot("A", ChargePointStatus::Available));
            queues.enqueue_update(snapshot("B", ChargePointStatus::Available));
        }

        let report = h.scheduler.run(&cancel).await.unwrap();

        let adds = report.adds.unwrap();
        assert!(matches!(adds.result, FlushCycleResult::Error(_)));
        assert_eq!(adds.items[0].warnings, vec!["Connection failed: reset by peer".to_string()]);
        assert_eq!(report.updates.unwrap().result, FlushCycleResult::Success);
        assert_eq!(report.statuses.unwrap().result, FlushCycleResult::Success);

        // The failed add is not requeued, and A's statuses flow freely again
        let mut queues = h.queues.lock(&cancel).await.unwrap();
        assert_eq!(queues.depth().to_add, 0);
        assert_eq!(queues.enqueue_status(status("A", ChargePointStatus::Occupied, 50)), StatusRoute::Fast);
    }

    #[tokio::test]
    async fn partial_update_rejection_is_per_item() {
        let h = harness(FeatureToggles::default());
        let cancel = CancellationToken::new();
        h.client.respond_next_data(Ok(UpstreamResponse::partly(ids(&["B"]))));
        {
            let mut queues = h.queues.lock(&cancel).await.unwrap();
            queues.enqueue_update(snapshot("A", ChargePointStatus::Available));
            queues.enqueue_update(snapshot("B", ChargePointStatus::Available));
        }

        let updates = h.scheduler.run(&cancel).await.unwrap().updates.unwrap();
        assert_eq!(updates.outcome_of(&ChargePointId::from("A")), Some(PushOutcome::Success));
        assert_eq!(updates.outcome_of(&ChargePointId::from("B")), Some(PushOutcome::Error));
    }

    #[tokio::test]
    async fn removals_are_drained_without_upstream_call() {
        let h = harness(FeatureToggles::default());
        let cancel = CancellationToken::new();
        h.queues.lock(&cancel).await.unwrap().enqueue_remove(ChargePointId::from("GONE"));

        let report = h.scheduler.run(&cancel).await.unwrap();

        let removals = report.removals.unwrap();
        assert_eq!(removals.items[0].outcome, PushOutcome::NoOperation);
        assert_eq!(removals.items[0].warnings, vec![REMOVAL_NOT_PROPAGATED.to_string()]);
        assert_eq!(h.client.call_count(), 0);
        assert_eq!(h.queues.depth().await.to_remove, 0);
    }

    #[tokio::test]
    async fn disabled_data_push_reports_admin_down() {
        let h = harness(FeatureToggles {
            disable_push_data: true,
            ..FeatureToggles::default()
        });
        let cancel = CancellationToken::new();
        h.queues.lock(&cancel).await.unwrap().enqueue_add(snapshot("A", ChargePointStatus::Available));

        let report = h.scheduler.run(&cancel).await.unwrap();

        assert_eq!(report.adds.unwrap().result, FlushCycleResult::AdminDown);
        assert_eq!(
            h.client.calls(),
            vec![RecordedCall::Status { ids: ids(&["A"]), ttl: None }]
        );
    }

    #[tokio::test]
    async fn cycle_results_are_published() {
        let h = harness(FeatureToggles::default());
        let mut subscriber = h.events.subscribe();
        let cancel = CancellationToken::new();
        h.queues.lock(&cancel).await.unwrap().enqueue_add(snapshot("A", ChargePointStatus::Available));

        let report = h.scheduler.run(&cancel).await.unwrap();

        let mut pushes = 0;
        let mut cycle = None;
        while let Some(message) = subscriber.try_recv() {
            match message.event {
                Event::PushCompleted(_) => pushes += 1,
                Event::CycleCompleted(c) => cycle = Some(c),
                _ => {}
            }
        }
        assert_eq!(pushes, 2);
        let cycle = cycle.expect("cycle summary");
        assert_eq!(cycle.cycle_id, report.cycle_id);
        assert_eq!(cycle.upstream_calls, 2);
    }

    #[tokio::test]
    async fn cancelled_before_swap_leaves_queues_untouched() {
        let h = harness(FeatureToggles::default());
        let cancel = CancellationToken::new();
        h.queues.lock(&cancel).await.unwrap().enqueue_add(snapshot("A", ChargePointStatus::Available));
        cancel.cancel();

        assert!(matches!(h.scheduler.run(&cancel).await, Err(AdapterError::Cancelled)));
        assert_eq!(h.queues.depth().await.to_add, 1);
    }
}
