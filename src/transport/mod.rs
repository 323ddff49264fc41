// src/transport/mod.rs
//! Network transport
//!
//! - **Wire**: newline-delimited JSON frames
//! - **Exchange**: listening and connecting TCP endpoints with reconnect
//! - **Hub**: routes forwarded responses back to the originating connection
//! - **AdServer**: HTTP endpoint for win/loss notifications

pub mod adserver;
pub mod exchange;
pub mod hub;
pub mod wire;

pub use adserver::AdServerConnector;
pub use exchange::ExchangeContext;
pub use hub::TransportHub;
pub use wire::{InboundMessage, OutboundMessage, WireBidRequest};
