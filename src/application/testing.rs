//! Test support: scripted roaming client and charge point directory

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::application::ports::{
    ChargePointDirectory, RoamingAuthorisation, RoamingClient, TransportError, UpstreamResponse,
};
use crate::domain::{
    CdrRecord, ChargePointId, ChargePointSnapshot, ChargePointStatus, SessionId, StatusRecord,
    TokenId,
};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Replace(Vec<ChargePointId>),
    Update(Vec<ChargePointId>),
    Status {
        ids: Vec<ChargePointId>,
        ttl: Option<DateTime<Utc>>,
    },
    Cdrs(Vec<SessionId>),
    Authorisation(TokenId),
}

type CpAnswer = Result<UpstreamResponse<ChargePointId>, TransportError>;
type CdrAnswer = Result<UpstreamResponse<SessionId>, TransportError>;

#[derive(Default)]
struct Script {
    calls: Vec<RecordedCall>,
    data: VecDeque<CpAnswer>,
    status: VecDeque<CpAnswer>,
    cdrs: VecDeque<CdrAnswer>,
    authorisations: HashMap<TokenId, Result<Option<RoamingAuthorisation>, TransportError>>,
}

/// Roaming client answering OK unless told otherwise
pub struct FakeRoamingClient {
    script: Mutex<Script>,
    gate: Arc<RwLock<()>>,
}

impl FakeRoamingClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            gate: Arc::new(RwLock::new(())),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }

    /// Block every upstream call until the returned guard is dropped.
    pub fn hold_calls(&self) -> OwnedRwLockWriteGuard<()> {
        self.gate.clone().try_write_owned().expect("gate already held")
    }

    /// Wait until at least `n` calls have been recorded.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.call_count() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn respond_next_data(&self, answer: CpAnswer) {
        self.script.lock().unwrap().data.push_back(answer);
    }

    pub fn respond_next_status(&self, answer: CpAnswer) {
        self.script.lock().unwrap().status.push_back(answer);
    }

    pub fn fail_next_status(&self, error: TransportError) {
        self.respond_next_status(Err(error));
    }

    pub fn respond_next_cdrs(&self, answer: CdrAnswer) {
        self.script.lock().unwrap().cdrs.push_back(answer);
    }

    pub fn authorise(&self, token: &str, contract: &str) {
        self.script.lock().unwrap().authorisations.insert(
            TokenId::from(token),
            Ok(Some(RoamingAuthorisation {
                contract_id: contract.into(),
                expiry: None,
                printed_number: None,
            })),
        );
    }

    pub fn deny(&self, token: &str) {
        self.script
            .lock()
            .unwrap()
            .authorisations
            .insert(TokenId::from(token), Ok(None));
    }

    pub fn fail_authorisation(&self, token: &str, error: TransportError) {
        self.script
            .lock()
            .unwrap()
            .authorisations
            .insert(TokenId::from(token), Err(error));
    }

    fn record(&self, call: RecordedCall) {
        self.script.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl RoamingClient for FakeRoamingClient {
    async fn replace_charge_point_list(&self, items: Vec<ChargePointSnapshot>) -> CpAnswer {
        self.record(RecordedCall::Replace(items.iter().map(|s| s.id.clone()).collect()));
        let _open = self.gate.read().await;
        let next = self.script.lock().unwrap().data.pop_front();
        next.unwrap_or_else(|| Ok(UpstreamResponse::ok()))
    }

    async fn update_charge_point_list(&self, items: Vec<ChargePointSnapshot>) -> CpAnswer {
        self.record(RecordedCall::Update(items.iter().map(|s| s.id.clone()).collect()));
        let _open = self.gate.read().await;
        let next = self.script.lock().unwrap().data.pop_front();
        next.unwrap_or_else(|| Ok(UpstreamResponse::ok()))
    }

    async fn update_status(
        &self,
        items: Vec<StatusRecord>,
        ttl_expiry: Option<DateTime<Utc>>,
    ) -> CpAnswer {
        self.record(RecordedCall::Status {
            ids: items.iter().map(|s| s.charge_point_id.clone()).collect(),
            ttl: ttl_expiry,
        });
        let _open = self.gate.read().await;
        let next = self.script.lock().unwrap().status.pop_front();
        next.unwrap_or_else(|| Ok(UpstreamResponse::ok()))
    }

    async fn add_cdrs(&self, items: Vec<CdrRecord>) -> CdrAnswer {
        self.record(RecordedCall::Cdrs(items.iter().map(|c| c.session_id.clone()).collect()));
        let _open = self.gate.read().await;
        let next = self.script.lock().unwrap().cdrs.pop_front();
        next.unwrap_or_else(|| Ok(UpstreamResponse::ok()))
    }

    async fn get_roaming_authorisation(
        &self,
        token: &TokenId,
    ) -> Result<Option<RoamingAuthorisation>, TransportError> {
        self.record(RecordedCall::Authorisation(token.clone()));
        let _open = self.gate.read().await;
        let answer = self.script.lock().unwrap().authorisations.get(token).cloned();
        answer.unwrap_or(Ok(None))
    }
}

/// Directory backed by a fixed list
#[derive(Default)]
pub struct StaticDirectory {
    statuses: Mutex<Vec<(ChargePointId, ChargePointStatus)>>,
}

impl StaticDirectory {
    pub fn new(statuses: &[(&str, ChargePointStatus)]) -> Self {
        Self {
            statuses: Mutex::new(
                statuses
                    .iter()
                    .map(|(id, status)| (ChargePointId::from(*id), *status))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl ChargePointDirectory for StaticDirectory {
    async fn current_statuses(&self) -> Vec<(ChargePointId, ChargePointStatus)> {
        self.statuses.lock().unwrap().clone()
    }
}
