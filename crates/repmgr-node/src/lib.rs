//! repmgr node - runs one replication site
//!
//! Loads configuration from a TOML file and `REPMGR_*` environment
//! variables, starts the replication manager and keeps it running until
//! interrupted.

pub mod config;
pub mod handler;

pub use config::{LogFormat, NodeConfig};
