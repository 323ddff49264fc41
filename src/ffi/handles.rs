// src/ffi/handles.rs
//! Handle tables backing the C ABI

use crate::agent::BiddingAgent;
use crate::engine::Engine;
use crate::events::event::Event;
use crate::events::ledger::Delivery;
use crate::utils::errors::{EngineError, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, c_int, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

static ENGINES: Lazy<Mutex<HashMap<u64, Engine>>> = Lazy::new(|| Mutex::new(HashMap::new()));

static AGENTS: Lazy<Mutex<HashMap<u64, AgentEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Addresses of events handed out and not yet freed
static LIVE_EVENTS: Lazy<Mutex<HashSet<usize>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Clone)]
pub(crate) struct AgentEntry {
    pub agent: Arc<BiddingAgent>,
    pub runtime: Handle,
}

fn next_handle() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn insert_engine(engine: Engine) -> u64 {
    let handle = next_handle();
    ENGINES.lock().insert(handle, engine);
    handle
}

pub(crate) fn remove_engine(handle: u64) -> Result<Engine> {
    ENGINES
        .lock()
        .remove(&handle)
        .ok_or_else(|| EngineError::InvalidHandle(format!("engine handle {}", handle)))
}

/// Run `f` against a live engine while its table entry is locked
pub(crate) fn with_engine<T>(handle: u64, f: impl FnOnce(&Engine) -> Result<T>) -> Result<T> {
    let engines = ENGINES.lock();
    let engine = engines
        .get(&handle)
        .ok_or_else(|| EngineError::InvalidHandle(format!("engine handle {}", handle)))?;
    f(engine)
}

pub(crate) fn insert_agent(agent: BiddingAgent, runtime: Handle) -> u64 {
    let handle = next_handle();
    AGENTS.lock().insert(
        handle,
        AgentEntry {
            agent: Arc::new(agent),
            runtime,
        },
    );
    handle
}

/// Clone an agent entry out of the table so blocking calls hold no lock
pub(crate) fn agent(handle: u64) -> Result<AgentEntry> {
    AGENTS
        .lock()
        .get(&handle)
        .cloned()
        .ok_or_else(|| EngineError::InvalidHandle(format!("agent handle {}", handle)))
}

pub(crate) fn remove_agent(handle: u64) -> Result<AgentEntry> {
    AGENTS
        .lock()
        .remove(&handle)
        .ok_or_else(|| EngineError::InvalidHandle(format!("agent handle {}", handle)))
}

/// Event as seen from C
#[repr(C)]
pub struct RtbEvent {
    /// `EventType` discriminant
    pub event_type: c_int,

    /// NUL-terminated JSON of the event subject
    pub subject: *const c_char,
}

/// Heap block behind an `RtbEvent` pointer; the header must stay first
#[repr(C)]
struct EventBox {
    header: RtbEvent,
    subject: CString,
    delivery: Delivery,
}

/// JSON of the payload carried by an event
pub(crate) fn subject_json(event: &Event) -> Result<String> {
    let json = match event {
        Event::BidRequest(r) => serde_json::to_string(r.as_ref())?,
        Event::WinNotification(w) => serde_json::to_string(w.as_ref())?,
        Event::LossNotification(l) => serde_json::to_string(l.as_ref())?,
        Event::Error(e) => serde_json::to_string(e)?,
        Event::ShutdownSignal(s) => serde_json::to_string(s)?,
    };
    Ok(json)
}

/// Move a delivery to the heap and hand out its C view
pub(crate) fn export_event(delivery: Delivery) -> Result<*mut RtbEvent> {
    let subject = CString::new(subject_json(delivery.event())?)
        .map_err(|e| EngineError::Protocol(format!("event subject: {}", e)))?;

    let boxed = Box::new(EventBox {
        header: RtbEvent {
            event_type: delivery.event_type().as_i32(),
            subject: std::ptr::null(),
        },
        subject,
        delivery,
    });
    let raw = Box::into_raw(boxed);
    // SAFETY: `raw` comes from Box::into_raw and is uniquely owned here
    unsafe {
        (*raw).header.subject = (*raw).subject.as_ptr();
    }

    LIVE_EVENTS.lock().insert(raw as usize);
    Ok(raw.cast::<RtbEvent>())
}

/// Take an event back; a pointer not currently handed out is `InvalidHandle`
pub(crate) fn reclaim_event(event: *mut RtbEvent) -> Result<Delivery> {
    if event.is_null() {
        return Err(EngineError::InvalidHandle("event is null".into()));
    }
    if !LIVE_EVENTS.lock().remove(&(event as usize)) {
        return Err(EngineError::InvalidHandle(format!(
            "event {:p} was not issued or is already freed",
            event
        )));
    }

    // SAFETY: the address was produced by `export_event` and was still live
    let EventBox { delivery, .. } = *unsafe { Box::from_raw(event.cast::<EventBox>()) };
    Ok(delivery)
}

pub(crate) fn is_live(event: *const RtbEvent) -> bool {
    !event.is_null() && LIVE_EVENTS.lock().contains(&(event as usize))
}

#[cfg(test)]
pub(crate) fn live_event_count() -> usize {
    LIVE_EVENTS.lock().len()
}
