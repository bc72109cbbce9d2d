//! Charge point aggregate
//!
//! Identifiers, static snapshots and status changes propagated upstream.

pub mod model;

pub use model::{
    latest_per_charge_point, ChargePointEvent, ChargePointId, ChargePointSnapshot,
    ChargePointStatus, StatusRecord, StatusUpdate,
};
