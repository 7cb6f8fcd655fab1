//! Storage layer: database handle, row models, and queries.

pub mod db;
pub mod models;
pub mod queries;

pub use db::{Database, DatabaseError};
pub use models::{
    OccupancyRow, RequestKind, RequestMethod, RequestStatus, SpotRow, VehicleClass,
    VerificationRequest,
};
pub use queries::{NewOccupancy, NewVerificationRequest};
