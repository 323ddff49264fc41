// src/events/ledger.rs
//! Ownership ledger for dequeued events
//!
//! Every event handed out by `next_event` is registered here under a fresh
//! [`EventId`] and wrapped in a move-only [`Delivery`]. Freeing consumes the
//! delivery, so in Rust a double free cannot be expressed; the ledger still
//! rejects a second release of the same id, which is what the C ABI relies
//! on to report `InvalidHandle` instead of corrupting memory.

use crate::events::event::{Event, EventType};
use crate::registry::AgentId;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Identifier of one delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    agent: AgentId,
    event_type: EventType,
}

/// Registry of delivered, not yet freed events
#[derive(Default)]
pub struct EventLedger {
    next_id: AtomicU64,
    outstanding: DashMap<EventId, Outstanding>,
    issued: AtomicU64,
    freed: AtomicU64,
}

impl EventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dequeued event and return its id
    pub fn issue(&self, agent: AgentId, event: &Event) -> EventId {
        let id = EventId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.outstanding.insert(
            id,
            Outstanding {
                agent,
                event_type: event.event_type(),
            },
        );
        self.issued.fetch_add(1, Ordering::Relaxed);
        trace!("Issued {} to {}", id, agent);
        id
    }

    /// Release an issued id exactly once
    pub fn release(&self, id: EventId) -> Result<()> {
        match self.outstanding.remove(&id) {
            Some(_) => {
                self.freed.fetch_add(1, Ordering::Relaxed);
                trace!("Freed {}", id);
                Ok(())
            }
            None => Err(EngineError::InvalidHandle(format!(
                "{} was not issued or is already freed",
                id
            ))),
        }
    }

    pub fn is_outstanding(&self, id: EventId) -> bool {
        self.outstanding.contains_key(&id)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Outstanding events held by one agent
    pub fn outstanding_for(&self, agent: AgentId) -> usize {
        self.outstanding.iter().filter(|e| e.value().agent == agent).count()
    }

    /// Event type recorded for an outstanding id
    pub fn event_type(&self, id: EventId) -> Option<EventType> {
        self.outstanding.get(&id).map(|e| e.value().event_type)
    }

    pub fn issued_total(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn freed_total(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }
}

/// An event owned by the caller until freed.
///
/// Not `Clone`: ownership moves with the value. Dropping an unfreed
/// delivery frees it.
pub struct Delivery {
    id: EventId,
    agent: AgentId,
    event: Event,
    ledger: Arc<EventLedger>,
    freed: bool,
}

impl Delivery {
    pub(crate) fn new(ledger: Arc<EventLedger>, agent: AgentId, event: Event) -> Self {
        let id = ledger.issue(agent, &event);
        Self {
            id,
            agent,
            event,
            ledger,
            freed: false,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    /// Release the event back to the engine
    pub fn free(mut self) -> Result<()> {
        self.freed = true;
        self.ledger.release(self.id)
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.freed {
            let _ = self.ledger.release(self.id);
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("event", &self.event)
            .finish()
    }
}
