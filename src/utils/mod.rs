// src/utils/mod.rs
//! Common utilities: error taxonomy, bootstrap configuration, backoff

pub mod backoff;
pub mod config;
pub mod errors;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{
    AdServerEndpoint, AgentDeclaration, EndpointMode, EngineConfig, ExchangeEndpoint,
    LogFormat, RiskLimits, RuntimeSettings, TelemetryConfig,
};
pub use errors::{EngineError, Result};
