//! Roaming adapter engine
//!
//! Owns the queues, the four flush timers, the CDR pipeline and the
//! authorization cache, and exposes the operations the operator's domain
//! model calls. Enqueue operations only take the queue lock; everything
//! that talks to upstream runs in a timer cycle or an explicit call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::authorization::{AuthorizationCache, AuthorizationResult};
use crate::application::cdr::{CdrMode, CdrPipeline};
use crate::application::filters::{
    forward_all_cdrs, include_all_charge_points, CdrFilter, ChargePointFilter,
};
use crate::application::ports::{ChargePointDirectory, RoamingClient};
use crate::application::queue::{FlushTimer, QueueDepth, QueueSet, QueueStore, StatusRoute, UpdateRoute};
use crate::application::sync::{
    record_queue_depth, FastStatusScheduler, FullSyncReport, FullSyncScheduler, StatusFlushReport,
    StatusRefreshReport, StatusRefresher,
};
use crate::application::upstream::UpstreamFacade;
use crate::config::AppConfig;
use crate::domain::{
    ChargeDetailRecord, ChargePointEvent, ChargePointId, ChargePointSnapshot, ContractId,
    FlushCycleResult, ItemResult, PushOperation, PushOutcome, PushReport, SessionId, StatusUpdate,
    TokenId,
};
use crate::notifications::{
    create_event_bus, AdapterExceptionEvent, Event, PushEvent, SharedEventBus,
};
use crate::shared::{AdapterError, SharedClock, SystemClock};

/// Warning attached to an update folded into a still pending add
pub const MERGED_INTO_ADD: &str = "merged into pending add";

/// Description of an update for a charge point scheduled for removal
pub const PENDING_REMOVAL: &str = "charge point is scheduled for removal";

/// Which timer an enqueued item needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arm {
    FullSync,
    FastStatus,
    Nothing,
}

pub struct RoamingAdapterBuilder {
    config: AppConfig,
    client: Arc<dyn RoamingClient>,
    directory: Arc<dyn ChargePointDirectory>,
    charge_point_filter: ChargePointFilter,
    cdr_filter: CdrFilter,
    clock: SharedClock,
    events: Option<SharedEventBus>,
}

impl RoamingAdapterBuilder {
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_charge_point_filter(mut self, filter: ChargePointFilter) -> Self {
        self.charge_point_filter = filter;
        self
    }

    pub fn with_cdr_filter(mut self, filter: CdrFilter) -> Self {
        self.cdr_filter = filter;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_bus(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the config, replay the authorization log and wire everything up.
    ///
    /// Timers are not running until [`RoamingAdapter::start`].
    pub async fn build(self) -> Result<Arc<RoamingAdapter>, AdapterError> {
        self.config.validate()?;

        let config = self.config;
        let sync = &config.sync;
        let features = &config.features;
        let events = self.events.unwrap_or_else(create_event_bus);
        let clock = self.clock;

        let facade = Arc::new(UpstreamFacade::new(self.client, sync.request_timeout()));
        let queues = Arc::new(QueueStore::new());

        let full_sync_timer = Arc::new(FlushTimer::new("full_sync"));
        let fast_status_timer = Arc::new(FlushTimer::new("fast_status"));
        let refresh_timer = Arc::new(FlushTimer::new("status_refresh"));
        let cdr_timer = Arc::new(FlushTimer::new("cdr_flush"));

        let authorizations = Arc::new(
            AuthorizationCache::open(
                &config.authorization,
                !features.disable_authorization,
                facade.clone(),
                events.clone(),
                clock.clone(),
            )
            .await?,
        );

        let full_sync = Arc::new(FullSyncScheduler::new(
            queues.clone(),
            facade.clone(),
            events.clone(),
            clock.clone(),
            full_sync_timer.clone(),
            features,
        ));
        let fast_status = Arc::new(FastStatusScheduler::new(
            queues.clone(),
            facade.clone(),
            events.clone(),
            clock.clone(),
            fast_status_timer,
            full_sync_timer,
            sync.full_sync_every(),
            !features.disable_push_status,
        ));
        let refresher = Arc::new(StatusRefresher::new(
            self.directory,
            self.charge_point_filter.clone(),
            facade.clone(),
            events.clone(),
            clock.clone(),
            sync.status_refresh_every(),
            !features.disable_status_refresh,
        ));
        let cdrs = Arc::new(CdrPipeline::new(
            facade,
            authorizations.clone(),
            self.cdr_filter,
            cdr_timer,
            sync.cdr_every(),
            sync.cdr_lock_wait(),
            events.clone(),
            clock.clone(),
            !features.disable_send_cdrs,
        ));

        info!(
            full_sync_secs = sync.full_sync_every_secs,
            status_secs = sync.status_every_secs,
            cdr_secs = sync.cdr_every_secs,
            refresh_secs = sync.status_refresh_every_secs,
            "Roaming adapter configured"
        );

        Ok(Arc::new(RoamingAdapter {
            config,
            queues,
            full_sync,
            fast_status,
            refresher,
            refresh_timer,
            cdrs,
            authorizations,
            filter: self.charge_point_filter,
            events,
            clock,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

pub struct RoamingAdapter {
    config: AppConfig,
    queues: Arc<QueueStore>,
    full_sync: Arc<FullSyncScheduler>,
    fast_status: Arc<FastStatusScheduler>,
    refresher: Arc<StatusRefresher>,
    refresh_timer: Arc<FlushTimer>,
    cdrs: Arc<CdrPipeline>,
    authorizations: Arc<AuthorizationCache>,
    filter: ChargePointFilter,
    events: SharedEventBus,
    clock: SharedClock,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoamingAdapter {
    pub fn builder(
        client: Arc<dyn RoamingClient>,
        directory: Arc<dyn ChargePointDirectory>,
    ) -> RoamingAdapterBuilder {
        RoamingAdapterBuilder {
            config: AppConfig::default(),
            client,
            directory,
            charge_point_filter: include_all_charge_points(),
            cdr_filter: forward_all_cdrs(),
            clock: Arc::new(SystemClock),
            events: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.events
    }

    // ---- Charge point data and status ----

    /// Queue charge points for the next full sync.
    pub async fn add_charge_points(
        &self,
        snapshots: Vec<ChargePointSnapshot>,
        cancel: &CancellationToken,
    ) -> PushReport<ChargePointId> {
        let enabled = !self.config.features.disable_push_data;
        self.enqueue(
            PushOperation::UpdateChargePoints,
            snapshots,
            enabled,
            cancel,
            |s| s.id.clone(),
            |queues, snapshot| {
                let id = snapshot.id.clone();
                queues.enqueue_add(snapshot);
                (ItemResult::enqueued(id), Arm::FullSync)
            },
        )
        .await
    }

    /// Queue static-data updates. An update of a charge point whose add is
    /// still queued refreshes that add instead.
    pub async fn update_charge_points(
        &self,
        snapshots: Vec<ChargePointSnapshot>,
        cancel: &CancellationToken,
    ) -> PushReport<ChargePointId> {
        let enabled = !self.config.features.disable_push_data;
        self.enqueue(
            PushOperation::UpdateChargePoints,
            snapshots,
            enabled,
            cancel,
            |s| s.id.clone(),
            |queues, snapshot| {
                let id = snapshot.id.clone();
                match queues.enqueue_update(snapshot) {
                    UpdateRoute::Queued => (ItemResult::enqueued(id), Arm::FullSync),
                    UpdateRoute::MergedIntoAdd => (
                        ItemResult::enqueued(id).with_warning(MERGED_INTO_ADD),
                        Arm::FullSync,
                    ),
                    UpdateRoute::Ignored => (
                        ItemResult::new(id, PushOutcome::NoOperation).with_description(PENDING_REMOVAL),
                        Arm::Nothing,
                    ),
                }
            },
        )
        .await
    }

    pub async fn remove_charge_points(
        &self,
        ids: Vec<ChargePointId>,
        cancel: &CancellationToken,
    ) -> PushReport<ChargePointId> {
        let enabled = !self.config.features.disable_push_data;
        self.enqueue(
            PushOperation::RemoveChargePoints,
            ids,
            enabled,
            cancel,
            ChargePointId::clone,
            |queues, id| {
                queues.enqueue_remove(id.clone());
                (ItemResult::enqueued(id), Arm::FullSync)
            },
        )
        .await
    }

    /// Queue status changes; a change for a charge point awaiting its add is
    /// held back until the add has been submitted.
    pub async fn update_statuses(
        &self,
        updates: Vec<StatusUpdate>,
        cancel: &CancellationToken,
    ) -> PushReport<ChargePointId> {
        let enabled = !self.config.features.disable_push_status;
        self.enqueue(
            PushOperation::UpdateStatus,
            updates,
            enabled,
            cancel,
            |u| u.charge_point_id.clone(),
            |queues, update| {
                let id = update.charge_point_id.clone();
                let arm = match queues.enqueue_status(update) {
                    StatusRoute::Fast => Arm::FastStatus,
                    StatusRoute::Delayed => Arm::FullSync,
                };
                (ItemResult::enqueued(id), arm)
            },
        )
        .await
    }

    async fn enqueue<T, I, F>(
        &self,
        operation: PushOperation,
        items: Vec<T>,
        enabled: bool,
        cancel: &CancellationToken,
        id_of: I,
        mut apply: F,
    ) -> PushReport<ChargePointId>
    where
        I: Fn(&T) -> ChargePointId,
        F: FnMut(&mut QueueSet, T) -> (ItemResult<ChargePointId>, Arm),
    {
        if !enabled {
            let items = items.iter().map(|i| ItemResult::admin_down(id_of(i))).collect();
            return self.local(operation, FlushCycleResult::AdminDown, items);
        }

        let (accepted, rejected): (Vec<T>, Vec<T>) =
            items.into_iter().partition(|i| (self.filter)(&id_of(i)));
        let mut results: Vec<ItemResult<ChargePointId>> =
            rejected.iter().map(|i| ItemResult::filtered(id_of(i))).collect();

        if accepted.is_empty() {
            return self.local(operation, FlushCycleResult::NoOperation, results);
        }

        let mut arm_full_sync = false;
        let mut arm_fast_status = false;
        {
            let mut queues = match self.queues.lock(cancel).await {
                Ok(queues) => queues,
                Err(e) => {
                    results.extend(accepted.iter().map(|i| {
                        ItemResult::new(id_of(i), PushOutcome::Timeout).with_description(e.to_string())
                    }));
                    return self.local(operation, FlushCycleResult::Timeout, results);
                }
            };
            for item in accepted {
                let (result, arm) = apply(&mut *queues, item);
                arm_full_sync |= arm == Arm::FullSync;
                arm_fast_status |= arm == Arm::FastStatus;
                results.push(result);
            }
            record_queue_depth(&queues.depth());
        }

        if arm_full_sync {
            self.full_sync.timer().arm(self.config.sync.full_sync_every());
        }
        if arm_fast_status {
            self.fast_status.timer().arm(self.config.sync.status_every());
        }

        let result = if results.iter().any(|r| r.outcome == PushOutcome::Enqueued) {
            FlushCycleResult::Enqueued
        } else {
            FlushCycleResult::NoOperation
        };
        debug!(%operation, items = results.len(), result = result.label(), "Enqueue finished");
        self.local(operation, result, results)
    }

    fn local(
        &self,
        operation: PushOperation,
        result: FlushCycleResult<ChargePointId>,
        items: Vec<ItemResult<ChargePointId>>,
    ) -> PushReport<ChargePointId> {
        let report = PushReport::local(operation, result, items);
        if report.result != FlushCycleResult::Enqueued {
            self.events.publish(Event::PushCompleted(PushEvent::from_report(
                &report,
                None,
                self.clock.now(),
            )));
        }
        report
    }

    // ---- CDRs and authorization ----

    pub async fn send_cdrs(
        &self,
        records: Vec<ChargeDetailRecord>,
        mode: CdrMode,
        cancel: &CancellationToken,
    ) -> PushReport<SessionId> {
        self.cdrs.send(records, mode, cancel).await
    }

    /// Ask upstream whether `token` may start a session.
    pub async fn authorize_start(
        &self,
        token: &TokenId,
        cancel: &CancellationToken,
    ) -> AuthorizationResult {
        self.authorizations.resolve(token, cancel).await
    }

    /// Contract last authorized for `token`, from memory only.
    pub fn lookup_contract(&self, token: &TokenId) -> Option<ContractId> {
        self.authorizations.lookup(token)
    }

    // ---- Manual cycles ----

    pub async fn flush_full_sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<FullSyncReport, AdapterError> {
        self.full_sync.run(cancel).await
    }

    pub async fn flush_fast_status(
        &self,
        cancel: &CancellationToken,
    ) -> Result<StatusFlushReport, AdapterError> {
        self.fast_status.run(cancel).await
    }

    pub async fn refresh_statuses(&self, cancel: &CancellationToken) -> StatusRefreshReport {
        self.refresher.run(cancel).await
    }

    pub async fn flush_cdrs(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<PushReport<SessionId>>, AdapterError> {
        self.cdrs.flush(cancel).await
    }

    pub async fn queue_depth(&self) -> QueueDepth {
        let mut depth = self.queues.depth().await;
        depth.cdrs = self.cdrs.pending().await;
        depth
    }

    // ---- Lifecycle ----

    /// Spawn the flush timers. A second call does nothing.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Roaming adapter already started");
            return;
        }

        let mut tasks = self.tasks.lock().await;

        let scheduler = self.full_sync.clone();
        tasks.push(self.spawn_cycle(self.full_sync.timer().clone(), move |cancel| {
            let scheduler = scheduler.clone();
            async move { scheduler.run(&cancel).await.map(|_| ()) }
        }));

        let scheduler = self.fast_status.clone();
        tasks.push(self.spawn_cycle(self.fast_status.timer().clone(), move |cancel| {
            let scheduler = scheduler.clone();
            async move { scheduler.run(&cancel).await.map(|_| ()) }
        }));

        let pipeline = self.cdrs.clone();
        tasks.push(self.spawn_cycle(self.cdrs.timer().clone(), move |cancel| {
            let pipeline = pipeline.clone();
            async move { pipeline.flush(&cancel).await.map(|_| ()) }
        }));

        // The refresh is periodic rather than activity driven: re-arm after every run
        let refresher = self.refresher.clone();
        let refresh_timer = self.refresh_timer.clone();
        tasks.push(self.spawn_cycle(self.refresh_timer.clone(), move |cancel| {
            let refresher = refresher.clone();
            let timer = refresh_timer.clone();
            async move {
                refresher.run(&cancel).await;
                if !cancel.is_cancelled() {
                    timer.arm(refresher.period());
                }
                Ok::<(), AdapterError>(())
            }
        }));
        self.refresh_timer.arm(self.refresher.period());

        info!(timers = tasks.len(), "Roaming adapter started");
    }

    /// Run `cycle` whenever `timer` fires; failures become adapter exceptions.
    fn spawn_cycle<F, Fut>(&self, timer: Arc<FlushTimer>, cycle: F) -> JoinHandle<()>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AdapterError>> + Send + 'static,
    {
        let cancel = self.shutdown.clone();
        let events = self.events.clone();
        let clock = self.clock.clone();
        let source = timer.name();

        timer.spawn(self.shutdown.clone(), self.events.clone(), self.clock.clone(), move || {
            let run = cycle(cancel.clone());
            let events = events.clone();
            let clock = clock.clone();
            async move {
                match run.await {
                    Ok(()) => {}
                    Err(AdapterError::Cancelled) => debug!(timer = source, "Cycle cancelled"),
                    Err(e) => {
                        error!(timer = source, error = %e, "Flush cycle failed");
                        events.publish(Event::AdapterException(AdapterExceptionEvent {
                            source: source.to_string(),
                            message: e.to_string(),
                            timestamp: clock.now(),
                        }));
                    }
                }
            }
        })
    }

    /// Stop all timers and wait for running cycles to end. In-flight upstream
    /// calls are cancelled and reported as timeouts.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Timer task ended abnormally");
            }
        }
        info!("Roaming adapter stopped");
    }

    // ---- Streams ----

    /// Feed charge point events until the stream ends or `cancel` fires.
    /// Returns the number of events consumed.
    pub async fn consume_charge_point_events<S>(&self, events: S, cancel: &CancellationToken) -> usize
    where
        S: Stream<Item = ChargePointEvent>,
    {
        futures_util::pin_mut!(events);
        let mut consumed = 0;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ChargePointEvent::Added(snapshot) => {
                    self.add_charge_points(vec![snapshot], cancel).await;
                }
                ChargePointEvent::Updated(snapshot) => {
                    self.update_charge_points(vec![snapshot], cancel).await;
                }
                ChargePointEvent::Removed(id) => {
                    self.remove_charge_points(vec![id], cancel).await;
                }
                ChargePointEvent::StatusChanged(update) => {
                    self.update_statuses(vec![update], cancel).await;
                }
            }
            consumed += 1;
        }

        debug!(consumed, "Charge point event stream finished");
        consumed
    }

    /// Enqueue completed sessions as CDRs, batching whatever is ready at once.
    pub async fn consume_sessions<S>(&self, sessions: S, cancel: &CancellationToken) -> usize
    where
        S: Stream<Item = ChargeDetailRecord>,
    {
        let batches = sessions.ready_chunks(64);
        futures_util::pin_mut!(batches);
        let mut consumed = 0;

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                next = batches.next() => match next {
                    Some(batch) => batch,
                    None => break,
                },
            };
            consumed += batch.len();
            self.send_cdrs(batch, CdrMode::Enqueue, cancel).await;
        }

        debug!(consumed, "Session stream finished");
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::authorization::AuthorizationOutcome;
    use crate::application::testing::{FakeRoamingClient, RecordedCall, StaticDirectory};
    use crate::config::FeatureToggles;
    use crate::domain::ChargePointStatus;
    use crate::shared::ManualClock;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::time::Duration;

    struct Harness {
        client: Arc<FakeRoamingClient>,
        adapter: Arc<RoamingAdapter>,
        _dir: tempfile::TempDir,
    }

    async fn harness_with(features: FeatureToggles, filter: ChargePointFilter) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeRoamingClient::new());
        let directory = Arc::new(StaticDirectory::new(&[
            ("evseA", ChargePointStatus::Available),
            ("evseB", ChargePointStatus::Occupied),
        ]));

        let mut config = AppConfig::default();
        config.features = features;
        config.authorization.log_directory = dir.path().to_path_buf();

        let adapter = RoamingAdapter::builder(client.clone(), directory)
            .with_config(config)
            .with_charge_point_filter(filter)
            .with_clock(Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap(),
            )))
            .build()
            .await
            .unwrap();

        Harness {
            client,
            adapter,
            _dir: dir,
        }
    }

    async fn harness() -> Harness {
        harness_with(FeatureToggles::default(), include_all_charge_points()).await
    }

    fn snapshot(id: &str) -> ChargePointSnapshot {
        ChargePointSnapshot::new(id, ChargePointStatus::Unknown, Utc.with_ymd_and_hms(2024, 7, 1, 11, 0, 0).unwrap())
    }

    fn available(id: &str) -> StatusUpdate {
        StatusUpdate::new(
            id,
            ChargePointStatus::Unknown,
            ChargePointStatus::Available,
            Utc.with_ymd_and_hms(2024, 7, 1, 11, 30, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn add_then_status_is_sent_as_one_replace_and_one_delayed_status() {
        let h = harness().await;
        let cancel = CancellationToken::new();

        let added = h.adapter.add_charge_points(vec![snapshot("evseA")], &cancel).await;
        let status = h.adapter.update_statuses(vec![available("evseA")], &cancel).await;
        assert_eq!(added.result, FlushCycleResult::Enqueued);
        assert_eq!(status.items[0].outcome, PushOutcome::Enqueued);

        let depth = h.adapter.queue_depth().await;
        assert_eq!(depth.status_delayed, 1);
        assert_eq!(depth.status_fast, 0);

        let fast = h.adapter.flush_fast_status(&cancel).await.unwrap();
        assert!(fast.report.is_none());
        h.adapter.flush_full_sync(&cancel).await.unwrap();

        assert_eq!(
            h.client.calls(),
            vec![
                RecordedCall::Replace(vec!["evseA".into()]),
                RecordedCall::Status {
                    ids: vec!["evseA".into()],
                    ttl: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn excluded_charge_points_are_filtered() {
        let only_a: ChargePointFilter = Arc::new(|id| id.as_str() == "evseA");
        let h = harness_with(FeatureToggles::default(), only_a).await;

        let report = h
            .adapter
            .add_charge_points(vec![snapshot("evseA"), snapshot("evseZ")], &CancellationToken::new())
            .await;

        assert_eq!(report.outcome_of(&"evseA".into()), Some(PushOutcome::Enqueued));
        assert_eq!(report.outcome_of(&"evseZ".into()), Some(PushOutcome::Filtered));
        assert_eq!(h.adapter.queue_depth().await.to_add, 1);
    }

    #[tokio::test]
    async fn disabled_status_push_is_admin_down_and_queues_nothing() {
        let h = harness_with(
            FeatureToggles {
                disable_push_status: true,
                ..FeatureToggles::default()
            },
            include_all_charge_points(),
        )
        .await;

        let report = h
            .adapter
            .update_statuses(vec![available("evseA")], &CancellationToken::new())
            .await;

        assert_eq!(report.result, FlushCycleResult::AdminDown);
        assert_eq!(h.adapter.queue_depth().await, QueueDepth::default());
    }

    #[tokio::test]
    async fn update_of_removed_charge_point_is_ignored() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        h.adapter.remove_charge_points(vec!["evseA".into()], &cancel).await;

        let report = h.adapter.update_charge_points(vec![snapshot("evseA")], &cancel).await;

        assert_eq!(report.result, FlushCycleResult::NoOperation);
        assert_eq!(report.items[0].description.as_deref(), Some(PENDING_REMOVAL));
    }

    #[tokio::test]
    async fn cancelled_enqueue_times_out() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.adapter.add_charge_points(vec![snapshot("evseA")], &cancel).await;

        assert_eq!(report.result, FlushCycleResult::Timeout);
        assert_eq!(h.adapter.queue_depth().await.to_add, 0);
    }

    #[tokio::test]
    async fn authorized_token_feeds_cdr_conversion() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        h.client.authorise("tokenX", "DE*ABC*1234*5");

        let result = h.adapter.authorize_start(&"tokenX".into(), &cancel).await;
        assert_eq!(result.contract_id().map(ContractId::as_str), Some("DE*ABC*1234*5"));
        assert_eq!(
            h.adapter.lookup_contract(&"tokenX".into()).map(|c| c.to_string()),
            Some("DE*ABC*1234*5".to_string())
        );

        let start = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let cdr = ChargeDetailRecord::new("S1", "evseA", start, start + chrono::Duration::minutes(30), Decimal::new(75, 1))
            .with_token("tokenX");
        let report = h.adapter.send_cdrs(vec![cdr], CdrMode::Direct, &cancel).await;
        assert_eq!(report.items[0].outcome, PushOutcome::Success);

        h.client.deny("tokenX");
        let denied = h.adapter.authorize_start(&"tokenX".into(), &cancel).await;
        assert_eq!(denied.outcome, AuthorizationOutcome::Denied);
        assert!(h.adapter.lookup_contract(&"tokenX".into()).is_none());
    }

    #[tokio::test]
    async fn event_streams_drive_the_queues() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        let events = futures_util::stream::iter(vec![
            ChargePointEvent::Added(snapshot("evseA")),
            ChargePointEvent::StatusChanged(available("evseA")),
            ChargePointEvent::StatusChanged(available("evseB")),
            ChargePointEvent::Removed("evseC".into()),
        ]);

        let consumed = h.adapter.consume_charge_point_events(events, &cancel).await;

        assert_eq!(consumed, 4);
        let depth = h.adapter.queue_depth().await;
        assert_eq!((depth.to_add, depth.status_delayed, depth.status_fast, depth.to_remove), (1, 1, 1, 1));

        let start = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let sessions = futures_util::stream::iter(vec![
            ChargeDetailRecord::new("S1", "evseA", start, start, Decimal::ONE).with_contract("C1"),
            ChargeDetailRecord::new("S2", "evseB", start, start, Decimal::ONE).with_contract("C2"),
        ]);
        assert_eq!(h.adapter.consume_sessions(sessions, &cancel).await, 2);
        assert_eq!(h.adapter.queue_depth().await.cdrs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_flush_in_the_background() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        h.adapter.start().await;

        h.adapter.update_statuses(vec![available("evseB")], &cancel).await;
        h.adapter.add_charge_points(vec![snapshot("evseA")], &cancel).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            h.client.calls(),
            vec![RecordedCall::Status {
                ids: vec!["evseB".into()],
                ttl: None
            }]
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.client.call_count(), 3);
        assert_eq!(h.client.calls()[1], RecordedCall::Replace(vec!["evseA".into()]));

        // Nothing new was queued, so no timer fires again
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.client.call_count(), 3);

        h.adapter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_rearms_itself() {
        let h = harness().await;
        h.adapter.start().await;
        let period = h.adapter.config().sync.status_refresh_every();

        tokio::time::sleep(period + Duration::from_secs(1)).await;
        assert_eq!(h.client.call_count(), 1);
        tokio::time::sleep(period).await;
        assert_eq!(h.client.call_count(), 2);
        match &h.client.calls()[1] {
            RecordedCall::Status { ids, ttl } => {
                assert_eq!(ids.len(), 2);
                assert!(ttl.is_some());
            }
            other => panic!("unexpected call {:?}", other),
        }

        h.adapter.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_timers() {
        let h = harness().await;
        h.adapter.start().await;
        h.adapter.shutdown().await;

        h.adapter
            .update_statuses(vec![available("evseB")], &CancellationToken::new())
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.client.call_count(), 0);
    }
}
