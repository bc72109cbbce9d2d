//! Charge detail record (CDR) domain entity

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::authorization::model::string_id;
use crate::domain::authorization::{ContractId, TokenId};
use crate::domain::charge_point::ChargePointId;

string_id!(
    /// Stable identifier of a charging session
    SessionId
);

/// Billing record of one completed charging session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeDetailRecord {
    pub session_id: SessionId,
    pub charge_point_id: ChargePointId,
    /// Token used to start the session, if it was started locally
    pub token_id: Option<TokenId>,
    /// Contract known at session start (remote start), skips the cache lookup
    pub contract_id: Option<ContractId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Consumed energy in kWh
    pub energy_kwh: Decimal,
}

impl ChargeDetailRecord {
    pub fn new(
        session_id: impl Into<SessionId>,
        charge_point_id: impl Into<ChargePointId>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        energy_kwh: Decimal,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            charge_point_id: charge_point_id.into(),
            token_id: None,
            contract_id: None,
            started_at,
            ended_at,
            energy_kwh,
        }
    }

    pub fn with_token(mut self, token_id: impl Into<TokenId>) -> Self {
        self.token_id = Some(token_id.into());
        self
    }

    pub fn with_contract(mut self, contract_id: impl Into<ContractId>) -> Self {
        self.contract_id = Some(contract_id.into());
        self
    }

    /// Convert into the upstream wire form.
    ///
    /// `resolve_contract` is consulted only when the record carries no contract id.
    pub fn to_wire(
        &self,
        resolve_contract: impl Fn(&TokenId) -> Option<ContractId>,
    ) -> Result<CdrRecord, CdrConversionError> {
        if self.session_id.as_str().trim().is_empty() {
            return Err(CdrConversionError::MalformedSessionId);
        }
        if !self.charge_point_id.is_well_formed() {
            return Err(CdrConversionError::MalformedChargePointId(
                self.charge_point_id.to_string(),
            ));
        }
        if self.ended_at < self.started_at {
            return Err(CdrConversionError::InvalidTimeRange);
        }

        let contract_id = match (&self.contract_id, &self.token_id) {
            (Some(contract), _) => contract.clone(),
            (None, Some(token)) => resolve_contract(token)
                .ok_or_else(|| CdrConversionError::UnknownToken(token.clone()))?,
            (None, None) => return Err(CdrConversionError::MissingIdentification),
        };

        Ok(CdrRecord {
            session_id: self.session_id.clone(),
            charge_point_id: self.charge_point_id.clone(),
            contract_id,
            token_id: self.token_id.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            energy_kwh: self.energy_kwh,
        })
    }
}

/// A CDR converted for submission via `AddCDRs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrRecord {
    pub session_id: SessionId,
    pub charge_point_id: ChargePointId,
    pub contract_id: ContractId,
    pub token_id: Option<TokenId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub energy_kwh: Decimal,
}

/// Why a single CDR could not be converted to wire form
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CdrConversionError {
    #[error("Session id is empty")]
    MalformedSessionId,
    #[error("Malformed charge point id: {0:?}")]
    MalformedChargePointId(String),
    #[error("Session ends before it starts")]
    InvalidTimeRange,
    #[error("No contract mapping for token {0}")]
    UnknownToken(TokenId),
    #[error("Record carries neither a token nor a contract id")]
    MissingIdentification,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn sample_cdr() -> ChargeDetailRecord {
        let start = Utc::now() - Duration::hours(1);
        ChargeDetailRecord::new("S-1", "DE*ABC*E1*1", start, start + Duration::minutes(45), Decimal::new(1250, 2))
    }

    #[test]
    fn explicit_contract_skips_lookup() {
        let cdr = sample_cdr().with_token("T1").with_contract("DE*ABC*C1*X");
        let wire = cdr.to_wire(|_| panic!("lookup must not run")).unwrap();
        assert_eq!(wire.contract_id.as_str(), "DE*ABC*C1*X");
        assert_eq!(wire.token_id.as_ref().map(TokenId::as_str), Some("T1"));
    }

    #[test]
    fn token_is_resolved_through_lookup() {
        let cdr = sample_cdr().with_token("T1");
        let wire = cdr.to_wire(|t| (t.as_str() == "T1").then(|| ContractId::from("DE*ABC*C2*Y"))).unwrap();
        assert_eq!(wire.contract_id.as_str(), "DE*ABC*C2*Y");
    }

    #[test]
    fn unmapped_token_is_a_conversion_error() {
        let cdr = sample_cdr().with_token("T9");
        assert_eq!(
            cdr.to_wire(|_| None),
            Err(CdrConversionError::UnknownToken(TokenId::from("T9")))
        );
    }

    #[test]
    fn record_without_identification_is_rejected() {
        assert_eq!(
            sample_cdr().to_wire(|_| None),
            Err(CdrConversionError::MissingIdentification)
        );
    }

    #[test]
    fn reversed_time_range_is_rejected() {
        let mut cdr = sample_cdr().with_contract("C");
        std::mem::swap(&mut cdr.started_at, &mut cdr.ended_at);
        assert_eq!(cdr.to_wire(|_| None), Err(CdrConversionError::InvalidTimeRange));
    }

    #[test]
    fn malformed_charge_point_id_is_rejected() {
        let mut cdr = sample_cdr().with_contract("C");
        cdr.charge_point_id = ChargePointId::from("bad id");
        assert!(matches!(
            cdr.to_wire(|_| None),
            Err(CdrConversionError::MalformedChargePointId(_))
        ));
    }
}
