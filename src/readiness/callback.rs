// src/readiness/callback.rs
//! Callback-backed readiness for hosts without pollable descriptors

use crate::readiness::ReadinessSignal;
use std::sync::atomic::{AtomicBool, Ordering};

type ReadyFn = dyn Fn(bool) + Send + Sync;

/// Calls `f(true)` when events become pending and `f(false)` when drained.
///
/// The callback runs on the thread that queued or dequeued the event while
/// the readiness lock is held; it must not call back into the engine.
pub struct CallbackSignal {
    callback: Box<ReadyFn>,
    ready: AtomicBool,
}

impl CallbackSignal {
    pub fn new(callback: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl ReadinessSignal for CallbackSignal {
    fn raise(&self) {
        self.ready.store(true, Ordering::Release);
        (self.callback)(true);
    }

    fn lower(&self) {
        self.ready.store(false, Ordering::Release);
        (self.callback)(false);
    }
}
