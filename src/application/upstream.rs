//! Upstream submission facade
//!
//! Call-through to the [`RoamingClient`] that adds what every submission
//! needs: cancellation, a request budget, runtime measurement, metrics and
//! the mapping of structured upstream answers onto per-item outcomes.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::ports::{
    ResultCode, RoamingAuthorisation, RoamingClient, TransportError, UpstreamResponse,
};
use crate::domain::{
    CdrRecord, ChargePointId, ChargePointSnapshot, FlushCycleResult, ItemResult, PushOperation,
    PushOutcome, PushReport, SessionId, StatusRecord, TokenId,
};

/// Description attached to items the upstream rejected in a partial result.
pub const IMPLAUSIBLE: &str = "implausible";

const MALFORMED_PARTIAL: &str = "malformed response: partial result without matching rejected items";

/// Record upstream request latency and outcome.
fn record_request(operation: &'static str, result: &'static str, elapsed: Duration) {
    metrics::histogram!("roaming_request_latency_seconds", "operation" => operation)
        .record(elapsed.as_secs_f64());
    metrics::counter!("roaming_requests_total", "operation" => operation, "result" => result)
        .increment(1);
}

/// Why an upstream call produced no structured answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    Cancelled,
    /// The request budget elapsed
    TimedOut,
    Transport(TransportError),
}

impl CallFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::TimedOut | Self::Transport(TransportError::Timeout)
        )
    }
}

impl Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "request budget exceeded"),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// Map a structured upstream answer onto per-item outcomes.
///
/// - `Ok`: every item succeeds
/// - `Partly`: listed items fail as implausible, the rest succeed; a partial
///   answer naming none of the submitted items is malformed
/// - `Error` or malformed: every item fails with the reason
pub fn decompose<Id>(
    ids: &[Id],
    response: UpstreamResponse<Id>,
) -> (FlushCycleResult<Id>, Vec<ItemResult<Id>>, Vec<String>)
where
    Id: Clone + Eq + Hash + Display,
{
    let mut warnings = Vec::new();

    match response.code {
        ResultCode::Ok => {
            if !response.rejected.is_empty() {
                warnings.push(format!(
                    "OK response listed {} rejected item(s); ignored",
                    response.rejected.len()
                ));
            }
            let items = ids.iter().cloned().map(ItemResult::success).collect();
            (FlushCycleResult::Success, items, warnings)
        }
        ResultCode::Partly => {
            let submitted: HashSet<&Id> = ids.iter().collect();
            let (known, unknown): (Vec<&Id>, Vec<&Id>) = response
                .rejected
                .iter()
                .partition(|id| submitted.contains(id));

            for id in &unknown {
                warnings.push(format!("Upstream rejected {} which was not submitted", id));
            }

            if known.is_empty() {
                return all_failed(ids, MALFORMED_PARTIAL.to_string(), warnings);
            }

            let rejected: HashSet<&Id> = known.into_iter().collect();
            let mut rejected_in_order = Vec::with_capacity(rejected.len());
            let items = ids
                .iter()
                .map(|id| {
                    if rejected.contains(id) {
                        rejected_in_order.push(id.clone());
                        let item = ItemResult::error(id.clone(), IMPLAUSIBLE);
                        match &response.description {
                            Some(d) => item.with_warning(d.clone()),
                            None => item,
                        }
                    } else {
                        ItemResult::success(id.clone())
                    }
                })
                .collect();
            (FlushCycleResult::PartialSuccess(rejected_in_order), items, warnings)
        }
        ResultCode::Error => {
            let reason = response
                .description
                .unwrap_or_else(|| "upstream error".to_string());
            all_failed(ids, reason, warnings)
        }
    }
}

fn all_failed<Id: Clone>(
    ids: &[Id],
    reason: String,
    warnings: Vec<String>,
) -> (FlushCycleResult<Id>, Vec<ItemResult<Id>>, Vec<String>) {
    let items = ids
        .iter()
        .cloned()
        .map(|id| ItemResult::error(id, reason.clone()))
        .collect();
    (FlushCycleResult::Error(reason), items, warnings)
}

/// Classify a failed call for a whole batch.
fn failed_batch<Id: Clone>(
    ids: &[Id],
    failure: &CallFailure,
) -> (FlushCycleResult<Id>, Vec<ItemResult<Id>>, Vec<String>) {
    if failure.is_timeout() {
        let items = ids
            .iter()
            .cloned()
            .map(|id| ItemResult::new(id, PushOutcome::Timeout).with_description(failure.to_string()))
            .collect();
        return (FlushCycleResult::Timeout, items, Vec::new());
    }

    let message = failure.to_string();
    let items = ids
        .iter()
        .cloned()
        .map(|id| ItemResult::error(id, "transport failure").with_warning(message.clone()))
        .collect();
    (FlushCycleResult::Error(message.clone()), items, vec![message])
}

/// Facade over the roaming-protocol client
pub struct UpstreamFacade {
    client: Arc<dyn RoamingClient>,
    request_timeout: Duration,
}

impl UpstreamFacade {
    pub fn new(client: Arc<dyn RoamingClient>, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    /// Run one upstream call under the cancellation token and request budget.
    async fn guarded<T, F>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        call: F,
    ) -> (Result<T, CallFailure>, Duration)
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallFailure::Cancelled),
            outcome = tokio::time::timeout(self.request_timeout, call) => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CallFailure::Transport(e)),
                Err(_) => Err(CallFailure::TimedOut),
            },
        };

        let elapsed = started.elapsed();
        let label = match &result {
            Ok(_) => "ok",
            Err(f) if f.is_timeout() => "timeout",
            Err(_) => "error",
        };
        record_request(operation, label, elapsed);

        (result, elapsed)
    }

    async fn push<Id, F>(
        &self,
        operation: PushOperation,
        ids: Vec<Id>,
        cancel: &CancellationToken,
        call: F,
    ) -> PushReport<Id>
    where
        Id: Clone + Eq + Hash + Display,
        F: Future<Output = Result<UpstreamResponse<Id>, TransportError>>,
    {
        let batch_id = Uuid::new_v4();
        let (answer, runtime) = self.guarded(operation.as_str(), cancel, call).await;

        let (result, items, warnings) = match answer {
            Ok(response) => decompose(&ids, response),
            Err(failure) => failed_batch(&ids, &failure),
        };

        match &result {
            FlushCycleResult::Success => info!(
                %batch_id,
                %operation,
                items = ids.len(),
                runtime_ms = runtime.as_millis() as u64,
                "Upstream push succeeded"
            ),
            other => warn!(
                %batch_id,
                %operation,
                items = ids.len(),
                result = other.label(),
                runtime_ms = runtime.as_millis() as u64,
                "Upstream push did not fully succeed"
            ),
        }

        PushReport {
            batch_id,
            operation,
            result,
            items,
            warnings,
            upstream_called: true,
            runtime,
        }
    }

    pub async fn replace_charge_points(
        &self,
        items: Vec<ChargePointSnapshot>,
        cancel: &CancellationToken,
    ) -> PushReport<ChargePointId> {
        let ids = items.iter().map(|s| s.id.clone()).collect();
        self.push(
            PushOperation::ReplaceChargePoints,
            ids,
            cancel,
            self.client.replace_charge_point_list(items),
        )
        .await
    }

    pub async fn update_charge_points(
        &self,
        items: Vec<ChargePointSnapshot>,
        cancel: &CancellationToken,
    ) -> PushReport<ChargePointId> {
        let ids = items.iter().map(|s| s.id.clone()).collect();
        self.push(
            PushOperation::UpdateChargePoints,
            ids,
            cancel,
            self.client.update_charge_point_list(items),
        )
        .await
    }

    /// `operation` distinguishes queued status pushes from the periodic refresh.
    pub async fn update_status(
        &self,
        operation: PushOperation,
        items: Vec<StatusRecord>,
        ttl_expiry: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> PushReport<ChargePointId> {
        let ids = items.iter().map(|s| s.charge_point_id.clone()).collect();
        self.push(
            operation,
            ids,
            cancel,
            self.client.update_status(items, ttl_expiry),
        )
        .await
    }

    pub async fn add_cdrs(
        &self,
        items: Vec<CdrRecord>,
        cancel: &CancellationToken,
    ) -> PushReport<SessionId> {
        let ids = items.iter().map(|c| c.session_id.clone()).collect();
        self.push(PushOperation::AddCdrs, ids, cancel, self.client.add_cdrs(items))
            .await
    }

    pub async fn get_roaming_authorisation(
        &self,
        token: &TokenId,
        cancel: &CancellationToken,
    ) -> (Result<Option<RoamingAuthorisation>, CallFailure>, Duration) {
        self.guarded(
            "get_roaming_authorisation",
            cancel,
            self.client.get_roaming_authorisation(token),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::FakeRoamingClient;
    use crate::domain::ChargePointStatus;

    fn sessions(ids: &[&str]) -> Vec<SessionId> {
        ids.iter().map(|s| SessionId::from(*s)).collect()
    }

    #[test]
    fn ok_marks_everything_successful() {
        let ids = sessions(&["S1", "S2"]);
        let (result, items, warnings) = decompose(&ids, UpstreamResponse::ok());
        assert!(result.is_success());
        assert!(items.iter().all(|i| i.outcome == PushOutcome::Success));
        assert!(warnings.is_empty());
    }

    #[test]
    fn partly_decomposes_per_item() {
        let ids = sessions(&["id1", "id2", "id3"]);
        let (result, items, _) = decompose(&ids, UpstreamResponse::partly(sessions(&["id2"])));

        assert_eq!(result, FlushCycleResult::PartialSuccess(sessions(&["id2"])));
        assert_eq!(items[0].outcome, PushOutcome::Success);
        assert_eq!(items[1].outcome, PushOutcome::Error);
        assert_eq!(items[1].description.as_deref(), Some(IMPLAUSIBLE));
        assert_eq!(items[2].outcome, PushOutcome::Success);
    }

    #[test]
    fn partly_with_foreign_ids_only_is_malformed() {
        let ids = sessions(&["S1", "S2"]);
        let (result, items, warnings) =
            decompose(&ids, UpstreamResponse::partly(sessions(&["S9"])));

        assert!(matches!(result, FlushCycleResult::Error(_)));
        assert!(items.iter().all(|i| i.outcome == PushOutcome::Error));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn partly_without_rejections_is_malformed() {
        let ids = sessions(&["S1"]);
        let (result, items, _) = decompose(&ids, UpstreamResponse::partly(Vec::new()));
        assert!(matches!(result, FlushCycleResult::Error(ref r) if r.starts_with("malformed")));
        assert_eq!(items[0].outcome, PushOutcome::Error);
    }

    #[test]
    fn error_uses_upstream_description() {
        let ids = sessions(&["S1", "S2"]);
        let (result, items, _) = decompose(&ids, UpstreamResponse::error("service unavailable"));
        assert_eq!(result, FlushCycleResult::Error("service unavailable".to_string()));
        assert!(items
            .iter()
            .all(|i| i.description.as_deref() == Some("service unavailable")));
    }

    #[tokio::test]
    async fn transport_failure_downgrades_batch_with_warning() {
        let client = Arc::new(FakeRoamingClient::new());
        client.fail_next_status(TransportError::Connection("refused".into()));
        let facade = UpstreamFacade::new(client.clone(), Duration::from_secs(5));

        let report = facade
            .update_status(
                PushOperation::UpdateStatus,
                vec![StatusRecord {
                    charge_point_id: ChargePointId::from("CP1"),
                    status: ChargePointStatus::Available,
                    timestamp: Utc::now(),
                }],
                None,
                &CancellationToken::new(),
            )
            .await;

        assert!(report.upstream_called);
        assert!(matches!(report.result, FlushCycleResult::Error(_)));
        assert_eq!(report.items[0].outcome, PushOutcome::Error);
        assert_eq!(report.items[0].warnings, vec!["Connection failed: refused".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_call_is_timeout() {
        let client = Arc::new(FakeRoamingClient::new());
        let facade = UpstreamFacade::new(client, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = facade.add_cdrs(Vec::new(), &cancel).await;

        assert_eq!(report.result, FlushCycleResult::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn request_budget_exceeded_is_timeout() {
        let client = Arc::new(FakeRoamingClient::new());
        let gate = client.hold_calls();
        let facade = UpstreamFacade::new(client, Duration::from_secs(2));

        let snapshot = ChargePointSnapshot::new("CP1", ChargePointStatus::Available, Utc::now());
        let report = facade
            .update_charge_points(vec![snapshot], &CancellationToken::new())
            .await;

        assert_eq!(report.result, FlushCycleResult::Timeout);
        assert_eq!(report.items[0].outcome, PushOutcome::Timeout);
        drop(gate);
    }
}
