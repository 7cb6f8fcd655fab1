//! Lotkeeper daemon library.
//!
//! Coordinates camera gateways for unattended parking facilities: the
//! framed TCP protocol, verification request lifecycle, heartbeats, and
//! the periodic full-scan reconciliation of stored occupancy.

pub mod heartbeat;
pub mod notify;
pub mod reconcile;
pub mod registry;
pub mod server;
pub mod storage;
pub mod verify;
