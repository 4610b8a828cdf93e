//! Database models and queries

pub mod entities;
pub mod init;
pub mod models;
pub mod observations;
pub mod status;

pub use entities::EntityStore;
pub use init::*;
pub use models::*;
pub use observations::{ObservationStore, StoredObservation};
pub use status::{RunRecord, StatusStore};
