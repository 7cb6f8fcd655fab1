//! Wire protocol for the Lotkeeper camera gateway link.
//!
//! Every message is a JSON object carrying an integer `cmd` discriminator,
//! framed with a 4-byte big-endian length header (see [`codec`]). The
//! server never processes a partial frame; malformed JSON inside a valid
//! frame is a per-message error the connection survives.

pub mod codec;

use serde::{Deserialize, Serialize};

/// Authentication accepted.
pub const AUTH_ACCEPTED: u8 = 0;
/// Authentication rejected: device id is not registered.
pub const AUTH_UNKNOWN_DEVICE: u8 = 2;

/// Errors produced while decoding an inbound payload.
///
/// These are recoverable per-message errors; frame-level I/O failures live
/// in [`codec::FrameError`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no `cmd` field")]
    MissingCommand,

    #[error("unknown command {0}")]
    UnknownCommand(u64),
}

/// One camera described in the authentication handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    pub camera_id: i64,
    pub camera_ip: String,
}

/// One `(spot, plate)` observation reported by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CarEntry {
    pub surface_id: i64,
    #[serde(default)]
    pub car_no: String,
}

/// `cmd:1` client → server: authentication handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Device identifier the gateway authenticates as.
    pub park_id: i64,
    #[serde(default)]
    pub request_seq: u64,
    #[serde(default)]
    pub camera_list: Vec<CameraInfo>,
}

/// `cmd:3` client → server: result of an entry-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryReport {
    /// Echoes the `request_seq` of the `cmd:2` request being answered.
    pub event_seq: u64,
    #[serde(default)]
    pub request_seq: u64,
    #[serde(default)]
    pub car_list: Vec<CarEntry>,
}

/// `cmd:6` client → server: result of an exit-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    /// Echoes the `request_seq` of the `cmd:5` request being answered.
    pub event_seq: u64,
    /// `None` when the gateway sent a malformed result.
    #[serde(default)]
    pub is_present: Option<bool>,
}

/// Any message a gateway may send to the server.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Auth(AuthRequest),
    Entry(EntryReport),
    Exit(ExitReport),
}

impl ClientMessage {
    /// Decode a raw frame payload, dispatching on the `cmd` field.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        let cmd = value
            .get("cmd")
            .and_then(serde_json::Value::as_u64)
            .ok_or(DecodeError::MissingCommand)?;
        match cmd {
            1 => Ok(Self::Auth(serde_json::from_value(value)?)),
            3 => Ok(Self::Entry(serde_json::from_value(value)?)),
            6 => Ok(Self::Exit(serde_json::from_value(value)?)),
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

/// `cmd:1` server → client: authentication verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthAck {
    pub cmd: u8,
    pub request_seq: u64,
    pub park_id: i64,
    pub code: u8,
}

impl AuthAck {
    pub const fn new(request_seq: u64, park_id: i64, code: u8) -> Self {
        Self { cmd: 1, request_seq, park_id, code }
    }
}

/// `cmd:2` server → client: detect which spot a vehicle entered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryCheck {
    pub cmd: u8,
    pub park_id: i64,
    pub request_seq: u64,
}

impl EntryCheck {
    pub const fn new(park_id: i64, request_seq: u64) -> Self {
        Self { cmd: 2, park_id, request_seq }
    }
}

/// `cmd:3` server → client: acknowledgement of an [`EntryReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryAck {
    pub cmd: u8,
    pub event_seq: u64,
    pub request_seq: u64,
    pub park_id: i64,
    pub code: u8,
}

impl EntryAck {
    pub const fn new(event_seq: u64, request_seq: u64, park_id: i64) -> Self {
        Self { cmd: 3, event_seq, request_seq, park_id, code: 0 }
    }
}

/// `cmd:4` server → client: no-op liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub cmd: u8,
    pub request_seq: u64,
}

impl Heartbeat {
    pub const fn new() -> Self {
        Self { cmd: 4, request_seq: 1 }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// `cmd:5` server → client: confirm a vehicle is still present at a spot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitCheck {
    pub cmd: u8,
    pub park_id: i64,
    pub request_seq: u64,
    pub surface_id: i64,
}

impl ExitCheck {
    pub const fn new(park_id: i64, request_seq: u64, surface_id: i64) -> Self {
        Self { cmd: 5, park_id, request_seq, surface_id }
    }
}

/// Full-facility scan submitted on the dedicated scan channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    /// Device identifier, as in [`AuthRequest`].
    pub park_id: i64,
    #[serde(default)]
    pub cars: Vec<CarEntry>,
}

/// Outcome summary returned for a [`ScanReport`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub departed: u32,
    pub relocated: u32,
    pub newly_parked: u32,
    pub skipped: u32,
}
