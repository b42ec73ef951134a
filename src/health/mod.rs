//! Health monitoring of backend servers
//!
//! This module provides:
//! - Periodic connect + ping checks per backend server
//! - Marking servers unusable after consecutive failures, usable again
//!   after one good check

mod monitor;
mod state;

pub use monitor::HealthMonitor;
