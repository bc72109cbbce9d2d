//! Charge point domain entities as seen by the roaming adapter

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Opaque identifier of a physical charge point (EVSE), e.g. `DE*ABC*E1234*1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChargePointId(String);

impl ChargePointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty and free of whitespace/control characters.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && !self.0.chars().any(|c| c.is_whitespace() || c.is_control())
    }
}

impl fmt::Display for ChargePointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChargePointId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ChargePointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Operational status of a charge point as published to the roaming service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChargePointStatus {
    Available,
    Reserved,
    Occupied,
    OutOfService,
    Offline,
    #[default]
    Unknown,
}

impl fmt::Display for ChargePointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "Available"),
            Self::Reserved => write!(f, "Reserved"),
            Self::Occupied => write!(f, "Occupied"),
            Self::OutOfService => write!(f, "OutOfService"),
            Self::Offline => write!(f, "Offline"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<&str> for ChargePointStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "available" => Self::Available,
            "reserved" => Self::Reserved,
            "occupied" | "charging" => Self::Occupied,
            "outofservice" | "out_of_service" | "faulted" => Self::OutOfService,
            "offline" => Self::Offline,
            _ => Self::Unknown,
        }
    }
}

/// Immutable static description of a charge point, captured at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargePointSnapshot {
    pub id: ChargePointId,
    /// Station the charge point belongs to
    pub station_id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Maximum charging power in kW
    pub max_power_kw: Option<Decimal>,
    /// Plug types, e.g. "Type2", "CCS"
    pub plugs: Vec<String>,
    /// Status at capture time
    pub status: ChargePointStatus,
    pub captured_at: DateTime<Utc>,
}

impl ChargePointSnapshot {
    pub fn new(
        id: impl Into<ChargePointId>,
        status: ChargePointStatus,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            station_id: None,
            name: None,
            address: None,
            latitude: None,
            longitude: None,
            max_power_kw: None,
            plugs: Vec::new(),
            status,
            captured_at,
        }
    }
}

/// A status change of one charge point.
///
/// Ordering is only meaningful per charge point id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub charge_point_id: ChargePointId,
    pub old_status: ChargePointStatus,
    pub new_status: ChargePointStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(
        charge_point_id: impl Into<ChargePointId>,
        old_status: ChargePointStatus,
        new_status: ChargePointStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            old_status,
            new_status,
            timestamp,
        }
    }

    /// Initial status of a freshly added charge point (old == new).
    pub fn initial(snapshot: &ChargePointSnapshot) -> Self {
        Self::new(
            snapshot.id.clone(),
            snapshot.status,
            snapshot.status,
            snapshot.captured_at,
        )
    }

    /// Wire form sent with `UpdateStatus`.
    pub fn to_record(&self) -> StatusRecord {
        StatusRecord {
            charge_point_id: self.charge_point_id.clone(),
            status: self.new_status,
            timestamp: self.timestamp,
        }
    }
}

/// Status as submitted upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub charge_point_id: ChargePointId,
    pub status: ChargePointStatus,
    pub timestamp: DateTime<Utc>,
}

/// Changes of the charge point network fed into the adapter
#[derive(Debug, Clone)]
pub enum ChargePointEvent {
    Added(ChargePointSnapshot),
    Updated(ChargePointSnapshot),
    Removed(ChargePointId),
    StatusChanged(StatusUpdate),
}

/// Collapse status updates to the newest one per charge point.
///
/// On equal timestamps the update seen last wins. Output is ordered by id.
pub fn latest_per_charge_point(
    updates: impl IntoIterator<Item = StatusUpdate>,
) -> Vec<StatusUpdate> {
    let mut latest: BTreeMap<ChargePointId, StatusUpdate> = BTreeMap::new();
    for update in updates {
        match latest.get(&update.charge_point_id) {
            Some(current) if current.timestamp > update.timestamp => {}
            _ => {
                latest.insert(update.charge_point_id.clone(), update);
            }
        }
    }
    latest.into_values().collect()
}
