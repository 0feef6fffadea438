//! Periodic service availability monitor.
//!
//! Probes TCP banners, SSH, IMAP and HTTP services, reports state changes
//! once per transition and keeps a round-robin series file per service in
//! step with the registry database.

pub mod config;
pub mod database;
pub mod monitoring;
pub mod orchestrator;
pub mod pool;
pub mod series;
