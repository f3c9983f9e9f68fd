//! pqb-core: Core types and configuration for pqtor-bench
//!
//! This crate provides the shared domain types, error enums, and on-disk
//! configuration structures (campaign plan, fleet file, topology profiles)
//! used by the fleet, runner, and CLI components.

pub mod config;
pub mod error;
pub mod types;

pub use error::OrchestratorError;
pub use types::{HostId, Role, TopologyId};
