//! Outcome taxonomy reported back for every charge point and CDR operation

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-item outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcome {
    /// Accepted upstream
    Success,
    /// Rejected upstream, malformed response, transport failure or conversion error
    Error,
    /// Queued, will be submitted by the next flush
    Enqueued,
    /// Excluded by a filter, never attempted
    Filtered,
    /// Internal budget exceeded or the call was cancelled
    Timeout,
    /// Nothing to do
    NoOperation,
    /// Feature switched off by configuration
    AdminDown,
}

impl PushOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Enqueued => "enqueued",
            Self::Filtered => "filtered",
            Self::Timeout => "timeout",
            Self::NoOperation => "no_operation",
            Self::AdminDown => "admin_down",
        }
    }
}

impl fmt::Display for PushOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result for a single charge point or CDR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult<Id> {
    pub id: Id,
    pub outcome: PushOutcome,
    pub description: Option<String>,
    pub warnings: Vec<String>,
}

impl<Id> ItemResult<Id> {
    pub fn new(id: Id, outcome: PushOutcome) -> Self {
        Self {
            id,
            outcome,
            description: None,
            warnings: Vec::new(),
        }
    }

    pub fn success(id: Id) -> Self {
        Self::new(id, PushOutcome::Success)
    }

    pub fn enqueued(id: Id) -> Self {
        Self::new(id, PushOutcome::Enqueued)
    }

    pub fn filtered(id: Id) -> Self {
        Self::new(id, PushOutcome::Filtered)
    }

    pub fn admin_down(id: Id) -> Self {
        Self::new(id, PushOutcome::AdminDown)
    }

    pub fn error(id: Id, description: impl Into<String>) -> Self {
        Self::new(id, PushOutcome::Error).with_description(description)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Outcome of one submitted batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum FlushCycleResult<Id> {
    Success,
    /// Some items were rejected upstream
    PartialSuccess(Vec<Id>),
    Error(String),
    Timeout,
    Enqueued,
    NoOperation,
    AdminDown,
}

impl<Id> FlushCycleResult<Id> {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess(_) => "partial_success",
            Self::Error(_) => "error",
            Self::Timeout => "timeout",
            Self::Enqueued => "enqueued",
            Self::NoOperation => "no_operation",
            Self::AdminDown => "admin_down",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Upstream operation a report belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOperation {
    ReplaceChargePoints,
    UpdateChargePoints,
    RemoveChargePoints,
    UpdateStatus,
    RefreshStatus,
    AddCdrs,
}

impl PushOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReplaceChargePoints => "replace_charge_points",
            Self::UpdateChargePoints => "update_charge_points",
            Self::RemoveChargePoints => "remove_charge_points",
            Self::UpdateStatus => "update_status",
            Self::RefreshStatus => "refresh_status",
            Self::AddCdrs => "add_cdrs",
        }
    }
}

impl fmt::Display for PushOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch result plus per-item outcomes, warnings and elapsed runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport<Id> {
    pub batch_id: Uuid,
    pub operation: PushOperation,
    pub result: FlushCycleResult<Id>,
    pub items: Vec<ItemResult<Id>>,
    pub warnings: Vec<String>,
    /// Whether the upstream service was actually called
    pub upstream_called: bool,
    pub runtime: Duration,
}

impl<Id> PushReport<Id> {
    /// Report for a batch that never reached upstream.
    pub fn local(
        operation: PushOperation,
        result: FlushCycleResult<Id>,
        items: Vec<ItemResult<Id>>,
    ) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            operation,
            result,
            items,
            warnings: Vec::new(),
            upstream_called: false,
            runtime: Duration::ZERO,
        }
    }

    pub fn count(&self, outcome: PushOutcome) -> usize {
        self.items.iter().filter(|i| i.outcome == outcome).count()
    }

    pub fn outcome_of(&self, id: &Id) -> Option<PushOutcome>
    where
        Id: PartialEq,
    {
        self.items.iter().find(|i| &i.id == id).map(|i| i.outcome)
    }
}
