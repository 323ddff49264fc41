// src/dispatch/mod.rs
//! Dispatching between transports and agents
//!
//! - **Dispatcher**: classification, fan-out, notification routing and
//!   response validation
//! - **AuctionBook**: deadlines, offers and forwarded bids per auction

pub mod auction_book;
pub mod dispatcher;

pub use auction_book::{AuctionBook, Claim, SweepReport};
pub use dispatcher::{DispatchSettings, DispatchStats, Dispatcher, OutboundSink};

use std::fmt;

/// Where an auction came from, and where its responses go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Injected in-process
    Local,
    /// An exchange connection
    Connection(u64),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Connection(id) => write!(f, "conn-{}", id),
        }
    }
}
