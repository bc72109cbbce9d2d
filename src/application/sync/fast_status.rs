//! Fast status cycle
//!
//! Pushes status changes of charge points the upstream already knows. Entries
//! whose charge point started waiting for an add since they were enqueued are
//! handed over to the full-sync cycle instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{publish_cycle, record_queue_depth};
use crate::application::queue::{FlushTimer, QueueStore};
use crate::application::upstream::UpstreamFacade;
use crate::domain::{
    latest_per_charge_point, ChargePointId, FlushCycleResult, ItemResult, PushOperation,
    PushReport, StatusUpdate,
};
use crate::notifications::{CycleKind, SharedEventBus};
use crate::shared::{AdapterError, SharedClock};

#[derive(Debug, Clone)]
pub struct StatusFlushReport {
    pub cycle_id: Uuid,
    /// Entries moved to the delayed queue
    pub redirected: usize,
    pub report: Option<PushReport<ChargePointId>>,
    pub runtime: Duration,
}

impl StatusFlushReport {
    pub fn upstream_calls(&self) -> usize {
        self.report.iter().filter(|r| r.upstream_called).count()
    }
}

pub struct FastStatusScheduler {
    queues: Arc<QueueStore>,
    facade: Arc<UpstreamFacade>,
    events: SharedEventBus,
    clock: SharedClock,
    timer: Arc<FlushTimer>,
    full_sync_timer: Arc<FlushTimer>,
    full_sync_every: Duration,
    enabled: bool,
}

impl FastStatusScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: Arc<QueueStore>,
        facade: Arc<UpstreamFacade>,
        events: SharedEventBus,
        clock: SharedClock,
        timer: Arc<FlushTimer>,
        full_sync_timer: Arc<FlushTimer>,
        full_sync_every: Duration,
        enabled: bool,
    ) -> Self {
        Self {
            queues,
            facade,
            events,
            clock,
            timer,
            full_sync_timer,
            full_sync_every,
            enabled,
        }
    }

    pub fn timer(&self) -> &Arc<FlushTimer> {
        &self.timer
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<StatusFlushReport, AdapterError> {
        let started = Instant::now();
        let cycle_id = Uuid::new_v4();
        self.timer.disarm();

        let batch = {
            let mut queues = self.queues.lock(cancel).await?;
            let batch = queues.swap_fast();
            record_queue_depth(&queues.depth());
            batch
        };

        if batch.redirected > 0 {
            debug!(%cycle_id, redirected = batch.redirected, "Statuses wait for pending adds");
            self.full_sync_timer.arm(self.full_sync_every);
        }

        let mut result = StatusFlushReport {
            cycle_id,
            redirected: batch.redirected,
            report: None,
            runtime: Duration::ZERO,
        };

        if batch.ready.is_empty() {
            return Ok(result);
        }

        let latest = latest_per_charge_point(batch.ready);
        let report = if self.enabled {
            let records = latest.iter().map(StatusUpdate::to_record).collect();
            self.facade
                .update_status(PushOperation::UpdateStatus, records, None, cancel)
                .await
        } else {
            PushReport::local(
                PushOperation::UpdateStatus,
                FlushCycleResult::AdminDown,
                latest
                    .into_iter()
                    .map(|s| ItemResult::admin_down(s.charge_point_id))
                    .collect(),
            )
        };

        result.runtime = started.elapsed();
        publish_cycle(
            &self.events,
            self.clock.as_ref(),
            cycle_id,
            CycleKind::FastStatus,
            &[&report],
            result.runtime,
        );
        info!(
            %cycle_id,
            statuses = report.items.len(),
            result = report.result.label(),
            "Fast status cycle finished"
        );
        result.report = Some(report);

        Ok(result)
    }
}
