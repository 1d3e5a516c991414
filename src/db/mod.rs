//! Database module for FleetWatch.
//!
//! Provides SQLite storage for monitors, alert rules, probe history and
//! transfer records.

mod models;
mod store;

pub use models::*;
pub use store::*;
