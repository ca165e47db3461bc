//! # Phoebus - EMS controller for Deye hybrid inverters
//!
//! A Rust implementation of a home energy-management controller: it reads
//! telemetry from a solar/battery inverter over its register protocol and
//! drives switched power outlets to absorb or shed load based on battery
//! state of charge, per-phase voltage, grid export, and inverter headroom.
//! A time-of-day schedule and an adaptive overpower-protection loop manage
//! the battery charge-current registers.
//!
//! ## Architecture
//!
//! The application follows a modular architecture with clear separation of
//! concerns:
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `inverter`: Modbus TCP link to the inverter and snapshot decoding
//! - `outlet`: Per-outlet connection lifecycle with backoff and quarantine
//! - `tapo`: Tapo plug client behind the outlet device traits
//! - `registry`: Aggregate outlet queries and command forwarding
//! - `engine`: Cascade decision engine, one result per poll cycle
//! - `schedule`: Time-of-day charge-current resolution
//! - `protection`: Adaptive charge-current boost stepping
//! - `driver`: Poll-loop orchestration and shutdown

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod inverter;
pub mod logging;
pub mod outlet;
pub mod protection;
pub mod registry;
pub mod schedule;
pub mod tapo;

// Re-export commonly used types
pub use config::Config;
pub use driver::EmsDriver;
pub use error::{PhoebusError, Result};
