//! Saving goals service
//!
//! Wires the domain crate to a store, runs the subscriptions under a
//! supervisor, and hosts configuration and logging for the binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod demo;
pub mod service;
pub mod telemetry;

pub use config::{AppConfig, ConfigError};
pub use service::{eventually, SavingGoalsService, ServiceError};
