//! patchwarden library crate
//!
//! Exposes the guard, ladder, and acceptance loop so benchmarks and
//! external tooling can drive them without going through CLI startup.

pub mod acceptance;
pub mod config;
pub mod diff;
pub mod error;
pub mod generator;
pub mod git_ops;
pub mod guard;
pub mod hermetic;
pub mod ladder;
pub mod lock;
pub mod rejection;
pub mod sink;
pub mod snapshot;
pub mod telemetry;
pub mod util;
