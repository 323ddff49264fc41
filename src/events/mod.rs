// src/events/mod.rs
//! Events, per-agent queues and the delivery ledger
//!
//! - **Event**: inbound tagged union and outbound agent events
//! - **Queue**: bounded per-agent FIFO with blocking, polling and async pop
//! - **Ledger**: exactly-once ownership of dequeued events
//!
//! # Flow
//!
//! ```text
//! Dispatcher ── push ──► AgentQueue ── pop ──► Delivery ── free ──► EventLedger
//!                          │
//!                          └─ occupancy ──► ReadinessGate (agent + engine)
//! ```

pub mod event;
pub mod ledger;
pub mod queue;

pub use event::{
    BidRequest, BidResponse, ErrorEvent, ErrorKind, Event, EventType, LossNotification,
    OutboundEvent, ShutdownReason, ShutdownSignal, Spot, SpotBid, WinNotification,
};
pub use ledger::{Delivery, EventId, EventLedger};
pub use queue::{AgentQueue, PushOutcome, QueueStats};
