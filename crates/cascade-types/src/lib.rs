//! Shared data types for the Cascade workflow engine.
//!
//! This crate contains the serde-friendly types that cross the engine's
//! boundaries: engine configuration, retry policies with their pure delay
//! math, structured run errors, execution reports, checkpoint state, and
//! telemetry events.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror, toml.

pub mod config;
pub mod error;
pub mod report;
pub mod retry;
pub mod state;
pub mod telemetry;
