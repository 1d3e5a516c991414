//! FleetWatch - service monitoring and alerting engine.
//!
//! Agents' probe reports enter through [`sentinel::ServiceSentinel::dispatch`]
//! and live host metrics through [`server::ServerRegistry`]; the admin layer
//! drives monitor and alert changes through the sentinels' `on_*` hooks.

pub mod alert;
pub mod config;
pub mod db;
pub mod mute;
pub mod notify;
pub mod scheduler;
pub mod sentinel;
pub mod server;
pub mod task;
pub mod web;
