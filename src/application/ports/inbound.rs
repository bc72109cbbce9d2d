//! Inbound port — read access to the operator's charge point network

use async_trait::async_trait;

use crate::domain::{ChargePointId, ChargePointStatus};

/// Source of the *current* status of every known charge point.
///
/// Used by the periodic status refresh, which bypasses the queues.
#[async_trait]
pub trait ChargePointDirectory: Send + Sync {
    async fn current_statuses(&self) -> Vec<(ChargePointId, ChargePointStatus)>;
}
