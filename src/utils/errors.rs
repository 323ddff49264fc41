// src/utils/errors.rs
//! Engine error taxonomy
//!
//! Fatal errors (`Config`, `Transport` at startup) prevent an engine from
//! being created at all. Everything else is reported to the caller that
//! triggered it and leaves other agents untouched.

use thiserror::Error;

/// Errors surfaced by the engine and its handles
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Missing or malformed bootstrap configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Endpoint could not be bound or connected
    #[error("transport error: {0}")]
    Transport(String),

    /// An agent with this name is already registered
    #[error("agent name already registered: {0}")]
    DuplicateName(String),

    /// Operation attempted after shutdown
    #[error("engine is closed")]
    EngineClosed,

    /// Released agent, freed event, or unknown handle
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Bid response for an auction that is expired, unknown or already answered
    #[error("stale auction {auction_id}: {reason}")]
    StaleAuction { auction_id: String, reason: String },

    /// Bid response violates configured risk limits
    #[error("risk limit exceeded: {0}")]
    RiskLimit(String),

    /// Malformed wire message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local I/O failure (descriptors, sockets after startup)
    #[error("I/O error: {0}")]
    Io(String),
}

impl EngineError {
    /// Stable numeric code used by the C ABI
    pub fn code(&self) -> i32 {
        match self {
            EngineError::Config(_) => -1,
            EngineError::Transport(_) => -2,
            EngineError::DuplicateName(_) => -3,
            EngineError::EngineClosed => -4,
            EngineError::InvalidHandle(_) => -5,
            EngineError::StaleAuction { .. } => -6,
            EngineError::RiskLimit(_) => -7,
            EngineError::Protocol(_) => -8,
            EngineError::Io(_) => -9,
        }
    }

    /// True for errors that make `initialize` fail
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::Transport(_))
    }

    pub(crate) fn stale(auction_id: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::StaleAuction {
            auction_id: auction_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;
