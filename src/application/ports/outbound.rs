//! Outbound port — the roaming-protocol client
//!
//! [`RoamingClient`] is the contract between the adapter core and the
//! concrete clearinghouse client (wire encoding, HTTP, TLS). The core only
//! relies on the structured results defined here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    ChargePointId, ChargePointSnapshot, CdrRecord, ContractId, SessionId, StatusRecord, TokenId,
};

/// Upstream result code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Partly,
    Error,
}

/// Structured upstream answer to a batch operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse<Id> {
    pub code: ResultCode,
    /// Items the upstream refused (meaningful for `Partly`)
    pub rejected: Vec<Id>,
    pub description: Option<String>,
}

impl<Id> UpstreamResponse<Id> {
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            rejected: Vec::new(),
            description: None,
        }
    }

    pub fn partly(rejected: Vec<Id>) -> Self {
        Self {
            code: ResultCode::Partly,
            rejected,
            description: None,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Error,
            rejected: Vec::new(),
            description: Some(description.into()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Positive answer of `GetRoamingAuthorisation`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoamingAuthorisation {
    pub contract_id: ContractId,
    pub expiry: Option<DateTime<Utc>>,
    pub printed_number: Option<String>,
}

/// Failure to get any structured answer from upstream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

/// Roaming-protocol client consumed by the adapter core.
#[async_trait]
pub trait RoamingClient: Send + Sync {
    /// Replace the complete upstream charge point list.
    async fn replace_charge_point_list(
        &self,
        items: Vec<ChargePointSnapshot>,
    ) -> Result<UpstreamResponse<ChargePointId>, TransportError>;

    /// Insert or update the given charge points.
    async fn update_charge_point_list(
        &self,
        items: Vec<ChargePointSnapshot>,
    ) -> Result<UpstreamResponse<ChargePointId>, TransportError>;

    /// Push statuses, optionally valid only until `ttl_expiry`.
    async fn update_status(
        &self,
        items: Vec<StatusRecord>,
        ttl_expiry: Option<DateTime<Utc>>,
    ) -> Result<UpstreamResponse<ChargePointId>, TransportError>;

    /// Submit charge detail records; rejected ids are session ids.
    async fn add_cdrs(
        &self,
        items: Vec<CdrRecord>,
    ) -> Result<UpstreamResponse<SessionId>, TransportError>;

    /// Ask upstream whether `token` may start a session. `None` means denied.
    async fn get_roaming_authorisation(
        &self,
        token: &TokenId,
    ) -> Result<Option<RoamingAuthorisation>, TransportError>;
}
