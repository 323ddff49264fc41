// src/readiness/mod.rs
//! Readiness notification
//!
//! A [`ReadinessGate`] counts queued events and flips its signals on the
//! 0 -> 1 and 1 -> 0 transitions. Counter update and signal flip happen
//! under one lock, so a poller can never observe "empty" while an event
//! is queued.
//!
//! Signals are pluggable through [`ReadinessSignal`]:
//!
//! - **PipeSignal** (unix): a non-blocking pipe whose read end is readable
//!   while events are pending; suitable for `poll`/`epoll`/`kqueue` loops
//! - **CallbackSignal**: invokes a closure on each transition, for hosts
//!   without native descriptors

pub mod callback;
#[cfg(unix)]
pub mod pipe;

pub use callback::CallbackSignal;
#[cfg(unix)]
pub use pipe::PipeSignal;

use crate::utils::errors::Result;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::trace;

/// Something that can reflect "events pending" to the outside world
pub trait ReadinessSignal: Send + Sync {
    /// Pending count went from zero to non-zero
    fn raise(&self);

    /// Pending count went back to zero
    fn lower(&self);

    /// Pollable descriptor, if this signal has one
    fn raw_fd(&self) -> Option<i32> {
        None
    }
}

/// Pending-event counter driving a set of readiness signals
pub struct ReadinessGate {
    pending: Mutex<usize>,
    signals: RwLock<Vec<Arc<dyn ReadinessSignal>>>,
}

impl ReadinessGate {
    /// Gate with no signals attached
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            signals: RwLock::new(Vec::new()),
        }
    }

    /// Gate with the platform's native descriptor signal attached
    pub fn with_platform_signal() -> Result<Self> {
        let gate = Self::new();

        #[cfg(unix)]
        gate.attach(Arc::new(PipeSignal::new()?));

        Ok(gate)
    }

    /// Attach a signal; it is raised immediately if events are pending
    pub fn attach(&self, signal: Arc<dyn ReadinessSignal>) {
        let pending = self.pending.lock();
        if *pending > 0 {
            signal.raise();
        }
        self.signals.write().push(signal);
    }

    /// Record `n` newly queued events
    pub fn add(&self, n: usize) {
        if n == 0 {
            return;
        }

        let mut pending = self.pending.lock();
        let was = *pending;
        *pending += n;

        if was == 0 {
            trace!("Readiness raised");
            for signal in self.signals.read().iter() {
                signal.raise();
            }
        }
    }

    /// Record `n` events leaving the queue
    pub fn sub(&self, n: usize) {
        if n == 0 {
            return;
        }

        let mut pending = self.pending.lock();
        let was = *pending;
        *pending = was.saturating_sub(n);

        if was > 0 && *pending == 0 {
            trace!("Readiness lowered");
            for signal in self.signals.read().iter() {
                signal.lower();
            }
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.pending() > 0
    }

    /// First pollable descriptor among the attached signals, or -1
    pub fn fd(&self) -> i32 {
        self.signals
            .read()
            .iter()
            .find_map(|s| s.raw_fd())
            .unwrap_or(-1)
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}
