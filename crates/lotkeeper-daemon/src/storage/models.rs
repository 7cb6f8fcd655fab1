//! Database models for the Lotkeeper daemon.

use serde::{Deserialize, Serialize};

/// Live or closed occupancy record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OccupancyRow {
    pub id: i64,
    pub spot_id: i64,
    pub facility_id: i64,
    pub vehicle_id: Option<i64>,
    pub plate: String,
    pub vehicle_class: String,
    pub entered_at: i64,
    pub depart_start_at: Option<i64>,
    pub depart_end_at: Option<i64>,
    pub auto_entry: i64,
    pub owner_id: i64,
    pub departed_at: Option<i64>,
}

/// Parking spot record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpotRow {
    pub id: i64,
    pub facility_id: i64,
    pub category: String,
    pub name: String,
}

impl SpotRow {
    /// Only these categories may receive a vehicle.
    pub fn is_parkable(&self) -> bool {
        matches!(self.category.as_str(), "standard" | "accessible")
    }
}

/// One tracked park/leave attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VerificationRequest {
    pub id: i64,
    pub facility_id: i64,
    pub vehicle_id: Option<i64>,
    pub plate: String,
    pub spot_id: Option<i64>,
    pub kind: String,
    pub method: String,
    pub status: String,
    pub occupancy_id: Option<i64>,
    pub requested_by: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VerificationRequest {
    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending.as_str()
    }

    pub fn method(&self) -> RequestMethod {
        if self.method == RequestMethod::Manual.as_str() {
            RequestMethod::Manual
        } else {
            RequestMethod::Auto
        }
    }
}

/// Verification request status. Terminal once it leaves `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Complete,
    Fail,
    Full,
}

impl RequestStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Complete => "COMPLETE",
            Self::Fail => "FAIL",
            Self::Full => "FULL",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry-check or exit-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Entry,
    Exit,
}

impl RequestKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the attempt was camera-driven or user-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Auto,
    Manual,
}

impl RequestMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    /// Notification policy for this method.
    ///
    /// Manual attempts notify synchronously at request time (outside this
    /// subsystem); their camera verification must stay silent no matter
    /// the outcome. This asymmetry is deliberate and carried as a flag so
    /// callers never re-derive it from control flow.
    pub const fn notify_policy(self) -> NotifyPolicy {
        match self {
            Self::Auto => NotifyPolicy::NotifyOnOutcome,
            Self::Manual => NotifyPolicy::Silent,
        }
    }
}

impl std::fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether verification outcomes produce user notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPolicy {
    NotifyOnOutcome,
    Silent,
}

/// Vehicle classification on an occupancy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleClass {
    Registered,
    Unregistered,
    Visitor,
}

impl VehicleClass {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Unregistered => "unregistered",
            Self::Visitor => "visitor",
        }
    }
}

impl std::fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
