//! In-memory registry of authenticated gateway connections.

mod connection;

pub use connection::{ConnectionRegistry, FacilityConnection, InFlight};
