//! Charge detail record aggregate

pub mod model;

pub use model::{CdrConversionError, CdrRecord, ChargeDetailRecord, SessionId};
