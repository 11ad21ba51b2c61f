//! plugin-depot - Local plugin package manager
//!
//! Keeps a bounded, checksummed cache of plugin versions, a durable registry
//! of what is installed, and runs install, update, rollback and uninstall as
//! compensating transactions over both.

pub mod cache;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod depot;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod orchestrator;
pub mod pin;
pub mod registry;
pub mod storage;
pub mod telemetry;
pub mod ui;
pub mod workspace;

pub use depot::Depot;
pub use error::{DepotError, DepotResult};
