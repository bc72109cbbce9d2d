//! Periodic full status refresh
//!
//! Bypasses the queues: reads the current status of every known charge point
//! and pushes the complete set in one call. The pushed statuses expire after
//! twice the refresh period, so one late refresh does not leave them stale.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::publish_cycle;
use crate::application::filters::ChargePointFilter;
use crate::application::ports::ChargePointDirectory;
use crate::application::upstream::UpstreamFacade;
use crate::domain::{ChargePointId, FlushCycleResult, ItemResult, PushOperation, PushReport, StatusRecord};
use crate::notifications::{CycleKind, SharedEventBus};
use crate::shared::SharedClock;

#[derive(Debug, Clone)]
pub struct StatusRefreshReport {
    pub cycle_id: Uuid,
    pub report: PushReport<ChargePointId>,
    pub runtime: Duration,
}

pub struct StatusRefresher {
    directory: Arc<dyn ChargePointDirectory>,
    filter: ChargePointFilter,
    facade: Arc<UpstreamFacade>,
    events: SharedEventBus,
    clock: SharedClock,
    period: Duration,
    enabled: bool,
    in_flight: Semaphore,
}

impl StatusRefresher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn ChargePointDirectory>,
        filter: ChargePointFilter,
        facade: Arc<UpstreamFacade>,
        events: SharedEventBus,
        clock: SharedClock,
        period: Duration,
        enabled: bool,
    ) -> Self {
        Self {
            directory,
            filter,
            facade,
            events,
            clock,
            period,
            enabled,
            in_flight: Semaphore::new(1),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Push every current status. An overlapping call is refused with
    /// `NoOperation` and makes no upstream call.
    pub async fn run(&self, cancel: &CancellationToken) -> StatusRefreshReport {
        let started = Instant::now();
        let cycle_id = Uuid::new_v4();

        if !self.enabled {
            return self.local(cycle_id, FlushCycleResult::AdminDown, started);
        }

        let _permit = match self.in_flight.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(%cycle_id, "Status refresh already running");
                return self.local(cycle_id, FlushCycleResult::NoOperation, started);
            }
        };

        let now = self.clock.now();
        let records: Vec<StatusRecord> = self
            .directory
            .current_statuses()
            .await
            .into_iter()
            .filter(|(id, _)| (self.filter)(id))
            .map(|(charge_point_id, status)| StatusRecord {
                charge_point_id,
                status,
                timestamp: now,
            })
            .collect();

        if records.is_empty() {
            return self.local(cycle_id, FlushCycleResult::NoOperation, started);
        }

        let ttl = now + chrono::Duration::seconds(2 * self.period.as_secs() as i64);
        let count = records.len();
        let report = self
            .facade
            .update_status(PushOperation::RefreshStatus, records, Some(ttl), cancel)
            .await;

        let runtime = started.elapsed();
        publish_cycle(
            &self.events,
            self.clock.as_ref(),
            cycle_id,
            CycleKind::StatusRefresh,
            &[&report],
            runtime,
        );
        info!(%cycle_id, statuses = count, %ttl, result = report.result.label(), "Status refresh finished");

        StatusRefreshReport {
            cycle_id,
            report,
            runtime,
        }
    }

    fn local(
        &self,
        cycle_id: Uuid,
        result: FlushCycleResult<ChargePointId>,
        started: Instant,
    ) -> StatusRefreshReport {
        StatusRefreshReport {
            cycle_id,
            report: PushReport::local(PushOperation::RefreshStatus, result, Vec::<ItemResult<_>>::new()),
            runtime: started.elapsed(),
        }
    }
}
