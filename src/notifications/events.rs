//! Notification events
//!
//! Everything the adapter reports back to the operator's domain model:
//! per-item push results, cycle summaries, authorization results and
//! background failures.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{PushOperation, PushOutcome, PushReport};

/// Event types for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// One batch reached a final outcome (submitted, filtered, admin down, ...)
    PushCompleted(PushEvent),
    /// A background or manually triggered cycle finished
    CycleCompleted(CycleEvent),
    /// Upstream answered an authorization request
    AuthorizationResolved(AuthorizationEvent),
    /// A background task failed or panicked
    AdapterException(AdapterExceptionEvent),
}

impl Event {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::PushCompleted(_) => "push_completed",
            Event::CycleCompleted(_) => "cycle_completed",
            Event::AuthorizationResolved(_) => "authorization_resolved",
            Event::AdapterException(_) => "adapter_exception",
        }
    }

    /// Cycle the event belongs to, if any
    pub fn cycle_id(&self) -> Option<Uuid> {
        match self {
            Event::PushCompleted(e) => e.cycle_id,
            Event::CycleCompleted(e) => Some(e.cycle_id),
            Event::AuthorizationResolved(_) | Event::AdapterException(_) => None,
        }
    }
}

/// Which scheduler produced a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    FullSync,
    FastStatus,
    StatusRefresh,
    CdrFlush,
}

/// Per-item result as carried by events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEvent {
    pub id: String,
    pub outcome: PushOutcome,
    pub description: Option<String>,
    pub warnings: Vec<String>,
}

/// Batch result event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub cycle_id: Option<Uuid>,
    pub batch_id: Uuid,
    pub operation: PushOperation,
    pub result: String,
    pub items: Vec<ItemEvent>,
    pub warnings: Vec<String>,
    pub runtime_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl PushEvent {
    pub fn from_report<Id: Display>(
        report: &PushReport<Id>,
        cycle_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            cycle_id,
            batch_id: report.batch_id,
            operation: report.operation,
            result: report.result.label().to_string(),
            items: report
                .items
                .iter()
                .map(|item| ItemEvent {
                    id: item.id.to_string(),
                    outcome: item.outcome,
                    description: item.description.clone(),
                    warnings: item.warnings.clone(),
                })
                .collect(),
            warnings: report.warnings.clone(),
            runtime_ms: report.runtime.as_millis() as u64,
            timestamp,
        }
    }
}

/// Cycle summary event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleEvent {
    pub cycle_id: Uuid,
    pub kind: CycleKind,
    pub upstream_calls: usize,
    pub runtime_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Authorization event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationEvent {
    pub token_id: String,
    pub outcome: String, // authorized, denied, error, timeout, admin_down
    pub contract_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Background failure event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterExceptionEvent {
    /// Task that failed, e.g. "full_sync_timer"
    pub source: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Wrapper for sending events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventMessage {
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }
}
