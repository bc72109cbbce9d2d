//! Domain model of the roaming adapter core
//!
//! Charge points and their status, charge detail records, authorization
//! identifiers and the outcome taxonomy reported back to the operator.

pub mod authorization;
pub mod cdr;
pub mod charge_point;
pub mod outcome;

pub use authorization::{CachedAuthorization, ContractId, TokenId};
pub use cdr::{CdrConversionError, CdrRecord, ChargeDetailRecord, SessionId};
pub use charge_point::{
    latest_per_charge_point, ChargePointEvent, ChargePointId, ChargePointSnapshot,
    ChargePointStatus, StatusRecord, StatusUpdate,
};
pub use outcome::{FlushCycleResult, ItemResult, PushOperation, PushOutcome, PushReport};
