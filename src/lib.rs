// src/lib.rs
//! Real-time bidding event engine
//!
//! Connects ad exchanges to in-process bidding agents. Bid requests are
//! classified against each agent's subscription filter and fanned out to
//! per-agent queues; agents answer through `send_event` and the engine
//! forwards valid, timely responses to the exchange the auction came from.
//!
//! # Architecture
//!
//! ```text
//!  exchanges ──TCP──► transport ──► dispatch ──► filter pool
//!  ad server ──HTTP─┘                 │
//!                                     ▼
//!                        registry: AgentQueue per agent ──► readiness fd
//!                                     │
//!                   BiddingAgent::next_event / send_event  (Rust or C ABI)
//! ```
//!
//! - **engine**: lifecycle, runtime and the process-level handle
//! - **agent**: per-agent handle: receive, respond, release
//! - **registry**: agent arena with generation-checked ids
//! - **filter**: subscription filters and bitset classification
//! - **dispatch**: fan-out, auction deadlines and win/loss routing
//! - **events**: event types, queues and the delivery ledger
//! - **readiness**: pollable descriptors and readiness callbacks
//! - **transport**: exchange connections and the ad server endpoint
//! - **ffi**: C ABI over engine and agent handles
//! - **observability**: tracing and metrics
//! - **utils**: errors, configuration, backoff

pub mod agent;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod ffi;
pub mod filter;
pub mod observability;
pub mod readiness;
pub mod registry;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use agent::BiddingAgent;
pub use engine::{Engine, EngineStats};
pub use events::{BidRequest, BidResponse, Delivery, Event, EventType, OutboundEvent, SpotBid};
pub use filter::AgentFilter;
pub use registry::AgentId;
pub use transport::{InboundMessage, OutboundMessage};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
