//! Tenant Lifecycle Server
//!
//! Configuration, telemetry and the in-process simulation behind the
//! `lifecycle-server` binary.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod simulation;
pub mod telemetry;

pub use config::ServerConfig;
pub use simulation::{run_simulation, ScenarioOutcome, SimulationReport};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
