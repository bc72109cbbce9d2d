//! CDR submission pipeline
//!
//! Records are split by the caller's filter, converted to wire form with the
//! contract resolved through the authorization cache, then either queued for
//! the CDR timer or submitted at once. Submitted batches are never retried:
//! a resend could bill a session twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::authorization::AuthorizationCache;
use crate::application::filters::{CdrFilter, CdrFilterDecision};
use crate::application::queue::{BoundedQueue, FlushTimer};
use crate::application::sync::publish_cycle;
use crate::application::upstream::UpstreamFacade;
use crate::domain::{
    CdrRecord, ChargeDetailRecord, FlushCycleResult, ItemResult, PushOperation, PushOutcome,
    PushReport, SessionId,
};
use crate::notifications::{CycleKind, Event, PushEvent, SharedEventBus};
use crate::shared::{AdapterError, SharedClock};

/// How forwarded records are submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdrMode {
    /// Queue for the next CDR flush and answer `Enqueued` right away
    Enqueue,
    /// Submit in one call now
    Direct,
}

pub struct CdrPipeline {
    queue: BoundedQueue<CdrRecord>,
    facade: Arc<UpstreamFacade>,
    cache: Arc<AuthorizationCache>,
    filter: CdrFilter,
    timer: Arc<FlushTimer>,
    flush_every: Duration,
    events: SharedEventBus,
    clock: SharedClock,
    enabled: bool,
}

impl CdrPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        facade: Arc<UpstreamFacade>,
        cache: Arc<AuthorizationCache>,
        filter: CdrFilter,
        timer: Arc<FlushTimer>,
        flush_every: Duration,
        lock_wait: Duration,
        events: SharedEventBus,
        clock: SharedClock,
        enabled: bool,
    ) -> Self {
        Self {
            queue: BoundedQueue::new("cdr queue", lock_wait),
            facade,
            cache,
            filter,
            timer,
            flush_every,
            events,
            clock,
            enabled,
        }
    }

    pub fn timer(&self) -> &Arc<FlushTimer> {
        &self.timer
    }

    pub async fn pending(&self) -> usize {
        self.queue.len().await
    }

    /// Filter, convert and queue or submit `records`.
    ///
    /// The report lists one item per input record, in input order.
    pub async fn send(
        &self,
        records: Vec<ChargeDetailRecord>,
        mode: CdrMode,
        cancel: &CancellationToken,
    ) -> PushReport<SessionId> {
        let started = Instant::now();

        if !self.enabled {
            let items = records
                .into_iter()
                .map(|r| ItemResult::admin_down(r.session_id))
                .collect();
            let report = PushReport::local(PushOperation::AddCdrs, FlushCycleResult::AdminDown, items);
            self.publish(&report);
            return report;
        }

        let mut slots: Vec<Option<ItemResult<SessionId>>> = vec![None; records.len()];
        let mut positions = Vec::new();
        let mut wire = Vec::new();

        for (index, record) in records.iter().enumerate() {
            if (self.filter)(record) == CdrFilterDecision::Filter {
                slots[index] = Some(ItemResult::filtered(record.session_id.clone()));
                continue;
            }
            match record.to_wire(|token| self.cache.lookup(token)) {
                Ok(converted) => {
                    positions.push(index);
                    wire.push(converted);
                }
                Err(e) => {
                    debug!(session_id = %record.session_id, error = %e, "CDR conversion failed");
                    slots[index] = Some(ItemResult::error(record.session_id.clone(), e.to_string()));
                }
            }
        }

        let conversion_failures = slots
            .iter()
            .flatten()
            .filter(|i| i.outcome == PushOutcome::Error)
            .count();

        let mut report = if wire.is_empty() {
            let result = if conversion_failures > 0 {
                FlushCycleResult::Error(format!("{} record(s) could not be converted", conversion_failures))
            } else {
                FlushCycleResult::NoOperation
            };
            PushReport::local(PushOperation::AddCdrs, result, Vec::new())
        } else {
            match mode {
                CdrMode::Enqueue => self.enqueue(wire).await,
                CdrMode::Direct => self.facade.add_cdrs(wire, cancel).await,
            }
        };

        for (index, item) in positions.into_iter().zip(std::mem::take(&mut report.items)) {
            slots[index] = Some(item);
        }
        report.items = slots.into_iter().flatten().collect();
        report.runtime = started.elapsed();

        self.publish(&report);
        report
    }

    async fn enqueue(&self, wire: Vec<CdrRecord>) -> PushReport<SessionId> {
        let ids: Vec<SessionId> = wire.iter().map(|c| c.session_id.clone()).collect();

        match self.queue.push_all(wire).await {
            Ok(depth) => {
                metrics::gauge!("roaming_queue_depth", "queue" => "cdrs").set(depth as f64);
                self.timer.arm(self.flush_every);
                debug!(records = ids.len(), depth, "CDRs enqueued");
                PushReport::local(
                    PushOperation::AddCdrs,
                    FlushCycleResult::Enqueued,
                    ids.into_iter().map(ItemResult::enqueued).collect(),
                )
            }
            Err(e) => {
                warn!(records = ids.len(), error = %e, "Could not enqueue CDRs");
                let items = ids
                    .into_iter()
                    .map(|id| ItemResult::new(id, PushOutcome::Timeout).with_description(e.to_string()))
                    .collect();
                PushReport::local(PushOperation::AddCdrs, FlushCycleResult::Timeout, items)
            }
        }
    }

    /// Submit everything queued. `None` when the queue was empty.
    pub async fn flush(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<PushReport<SessionId>>, AdapterError> {
        let started = Instant::now();
        self.timer.disarm();

        let batch = self.queue.swap_and_clear().await?;
        metrics::gauge!("roaming_queue_depth", "queue" => "cdrs").set(0.0);
        if batch.is_empty() {
            return Ok(None);
        }

        let cycle_id = Uuid::new_v4();
        let count = batch.len();
        let report = self.facade.add_cdrs(batch, cancel).await;
        let runtime = started.elapsed();

        publish_cycle(
            &self.events,
            self.clock.as_ref(),
            cycle_id,
            CycleKind::CdrFlush,
            &[&report],
            runtime,
        );
        info!(%cycle_id, records = count, result = report.result.label(), "CDR flush finished");

        Ok(Some(report))
    }

    fn publish(&self, report: &PushReport<SessionId>) {
        self.events.publish(Event::PushCompleted(PushEvent::from_report(
            report,
            None,
            self.clock.now(),
        )));
    }
}
