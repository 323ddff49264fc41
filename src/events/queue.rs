// src/events/queue.rs
//! Bounded per-agent event queue
//!
//! Each agent owns one queue with its own lock, so a congested agent never
//! delays delivery to another. Consumers can block (condition variable),
//! poll (`try_pop`) or await (`pop_async`). Closing the queue wakes every
//! waiter.
//!
//! Overflow is never silent: a full queue rejects the event, counts it,
//! and the next accepted event is preceded by an `Error{QueueOverflow}`
//! event carrying the number of drops. The notice takes a slot of its
//! own, so the queue never holds more than `capacity` items.

use crate::events::event::{ErrorEvent, Event, ShutdownReason, ShutdownSignal};
use crate::readiness::ReadinessGate;
use crate::utils::errors::{EngineError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Outcome of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue at capacity; the event was counted and dropped
    Full,
    /// Queue closed by release or shutdown; the event was discarded
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Open,
    Released,
    Shutdown { discarded: u64, signalled: bool },
}

struct Inner {
    items: VecDeque<Event>,
    state: QueueState,
    /// Drops not yet reported to the consumer
    unreported_drops: u64,
}

/// Per-agent event queue
pub struct AgentQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    available: Condvar,
    async_waiters: Notify,
    gates: Vec<Arc<ReadinessGate>>,

    push_count: AtomicU64,
    pop_count: AtomicU64,
    drop_count: AtomicU64,
}

impl AgentQueue {
    /// Create a queue reporting its occupancy to `gates`.
    ///
    /// Capacity is at least 2: an event plus a pending overflow notice.
    pub fn new(capacity: usize, gates: Vec<Arc<ReadinessGate>>) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                state: QueueState::Open,
                unreported_drops: 0,
            }),
            available: Condvar::new(),
            async_waiters: Notify::new(),
            gates,
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Append an event
    pub fn push(&self, event: Event) -> PushOutcome {
        let mut inner = self.inner.lock();

        if inner.state != QueueState::Open {
            return PushOutcome::Closed;
        }

        let notice = usize::from(inner.unreported_drops > 0);
        if inner.items.len() + notice >= self.capacity {
            inner.unreported_drops += 1;
            self.drop_count.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Full;
        }

        let mut added = 1;
        if notice > 0 {
            let dropped = std::mem::take(&mut inner.unreported_drops);
            warn!("Reporting {} dropped events to consumer", dropped);
            inner.items.push_back(Event::Error(ErrorEvent::overflow(dropped)));
            added += 1;
        }
        inner.items.push_back(event);
        self.push_count.fetch_add(1, Ordering::Relaxed);
        self.raise(added);
        drop(inner);

        self.available.notify_one();
        self.async_waiters.notify_waiters();
        PushOutcome::Queued
    }

    /// Take the next event without waiting; `Ok(None)` means would-block
    pub fn try_pop(&self) -> Result<Option<Event>> {
        let mut inner = self.inner.lock();
        self.take(&mut inner)
    }

    /// Block until an event arrives or the queue is closed
    pub fn pop_blocking(&self) -> Result<Event> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(event) = self.take(&mut inner)? {
                return Ok(event);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Block for at most `timeout`; `Ok(None)` on timeout
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<Event>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(event) = self.take(&mut inner)? {
                return Ok(Some(event));
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                return self.take(&mut inner);
            }
        }
    }

    /// Resolve once an event arrives or the queue is closed
    pub async fn pop_async(&self) -> Result<Event> {
        loop {
            let notified = self.async_waiters.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed
            notified.as_mut().enable();

            if let Some(event) = self.try_pop()? {
                return Ok(event);
            }
            notified.await;
        }
    }

    /// Close the queue, discard pending events and wake every waiter.
    ///
    /// Returns the number of discarded events. Closing twice is a no-op.
    pub fn close(&self, reason: Option<ShutdownReason>) -> u64 {
        let mut inner = self.inner.lock();
        if inner.state != QueueState::Open {
            return 0;
        }

        let discarded = inner.items.len() as u64;
        inner.items.clear();
        self.lower(discarded as usize);

        inner.state = match reason {
            Some(_) => {
                // The synthetic shutdown event keeps the agent readable until observed
                self.raise(1);
                QueueState::Shutdown {
                    discarded,
                    signalled: false,
                }
            }
            None => QueueState::Released,
        };
        drop(inner);

        debug!("Queue closed, {} events discarded", discarded);
        self.available.notify_all();
        self.async_waiters.notify_waiters();
        discarded
    }

    fn take(&self, inner: &mut Inner) -> Result<Option<Event>> {
        if let Some(event) = inner.items.pop_front() {
            self.pop_count.fetch_add(1, Ordering::Relaxed);
            self.lower(1);
            return Ok(Some(event));
        }

        match inner.state {
            QueueState::Open => Ok(None),
            QueueState::Released => Err(EngineError::InvalidHandle("agent released".into())),
            QueueState::Shutdown { signalled: true, .. } => Err(EngineError::EngineClosed),
            QueueState::Shutdown { discarded, signalled: false } => {
                inner.state = QueueState::Shutdown {
                    discarded,
                    signalled: true,
                };
                self.lower(1);
                Ok(Some(Event::ShutdownSignal(ShutdownSignal {
                    reason: ShutdownReason::EngineShutdown,
                    discarded,
                })))
            }
        }
    }

    fn raise(&self, n: usize) {
        for gate in &self.gates {
            gate.add(n);
        }
    }

    fn lower(&self, n: usize) {
        for gate in &self.gates {
            gate.sub(n);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().state == QueueState::Open
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Events accepted
    pub push_count: u64,

    /// Events handed to the consumer, including overflow notices
    pub pop_count: u64,

    /// Events rejected because the queue was full
    pub drop_count: u64,

    pub current_size: usize,

    pub capacity: usize,
}

impl QueueStats {
    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }

    /// Calculate drop rate
    pub fn drop_rate(&self) -> f64 {
        let offered = self.push_count + self.drop_count;
        if offered == 0 {
            0.0
        } else {
            (self.drop_count as f64 / offered as f64) * 100.0
        }
    }
}
