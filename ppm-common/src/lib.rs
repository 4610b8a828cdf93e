//! # PPM Common Library
//!
//! Shared code for the PPM master data services including:
//! - Entity and observation stores (SQLite)
//! - Aggregate row model and the backing-store seam (`store`)
//! - Collection status bookkeeping
//! - Read interface (ranked queries, search, area summary)
//! - Configuration loading
//! - Geographic helpers

pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod read;
pub mod sources;
pub mod store;
pub mod time;

pub use error::{Error, Result};
pub use geo::{Bounds, GeoPoint};
pub use sources::SourceKind;
