// src/ffi/exports.rs
//! Exported `rtb_*` functions
//!
//! See `include/rtb_engine.h` for the C declarations.

use crate::engine::Engine;
use crate::events::event::{BidResponse, OutboundEvent};
use crate::ffi::handles::{self, RtbEvent};
use crate::ffi::{guard, str_arg, RTB_OK, RTB_WOULD_BLOCK};
use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::ffi::{c_char, c_int, c_void};
use std::time::Duration;
use tracing::debug;

/// Completion callback of `rtb_next_event_async`
pub type RtbEventCallback = extern "C" fn(user_data: *mut c_void, status: c_int, event: *mut RtbEvent);

/// Caller context carried to the completing thread
struct UserData(*mut c_void);

// SAFETY: the pointer is opaque to the engine and only handed back to the caller's callback
unsafe impl Send for UserData {}

impl UserData {
    fn into_raw(self) -> *mut c_void {
        self.0
    }
}

#[derive(Deserialize)]
struct ConfigBody {
    filter: String,
}

unsafe fn write_out<T>(out: *mut T, value: T) -> Result<()> {
    if out.is_null() {
        return Err(EngineError::InvalidHandle("output pointer is null".into()));
    }
    out.write(value);
    Ok(())
}

fn check_out<T>(out: *mut T) -> Result<()> {
    if out.is_null() {
        return Err(EngineError::InvalidHandle("output pointer is null".into()));
    }
    Ok(())
}

// =============================================================================
// ENGINE
// =============================================================================

/// Start an engine from the bootstrap file at `config_path`
///
/// # Safety
/// `config_path` must be a NUL-terminated string; `out_engine` must be writable.
#[no_mangle]
pub unsafe extern "C" fn rtb_initialize(config_path: *const c_char, out_engine: *mut u64) -> c_int {
    guard(|| {
        check_out(out_engine)?;
        let path = str_arg(config_path, "config_path")
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let engine = Engine::initialize(path)?;
        write_out(out_engine, handles::insert_engine(engine))?;
        Ok(RTB_OK)
    })
}

/// Stop an engine; its agents observe one `ShutdownSignal` each
#[no_mangle]
pub extern "C" fn rtb_shutdown(engine: u64) -> c_int {
    guard(|| {
        handles::remove_engine(engine)?.shutdown()?;
        Ok(RTB_OK)
    })
}

/// Engine readiness descriptor, -1 when the platform has none
#[no_mangle]
pub extern "C" fn rtb_fd(engine: u64) -> c_int {
    guard(|| handles::with_engine(engine, |e| Ok(e.fd())))
}

// =============================================================================
// AGENTS
// =============================================================================

/// Register an agent under `name`
///
/// # Safety
/// `name` must be a NUL-terminated string; `out_agent` must be writable.
#[no_mangle]
pub unsafe extern "C" fn rtb_create_bidding_agent(engine: u64, name: *const c_char, out_agent: *mut u64) -> c_int {
    guard(|| {
        check_out(out_agent)?;
        let name = str_arg(name, "name")?;
        let (agent, runtime) = handles::with_engine(engine, |e| Ok((e.create_bidding_agent(name)?, e.runtime_handle())))?;
        write_out(out_agent, handles::insert_agent(agent, runtime))?;
        Ok(RTB_OK)
    })
}

/// Release an agent; a second release is `InvalidHandle`
#[no_mangle]
pub extern "C" fn rtb_release(agent: u64) -> c_int {
    guard(|| {
        let entry = handles::remove_agent(agent)?;
        entry.agent.unregister()?;
        Ok(RTB_OK)
    })
}

/// Agent readiness descriptor, -1 when the platform has none
#[no_mangle]
pub extern "C" fn rtb_agent_fd(agent: u64) -> c_int {
    guard(|| Ok(handles::agent(agent)?.agent.fd()))
}

// =============================================================================
// EVENTS
// =============================================================================

/// Block until the next event
///
/// # Safety
/// `out_event` must be writable.
#[no_mangle]
pub unsafe extern "C" fn rtb_next_event(agent: u64, out_event: *mut *mut RtbEvent) -> c_int {
    guard(|| {
        check_out(out_event)?;
        let entry = handles::agent(agent)?;
        let delivery = entry.agent.next_event()?;
        write_out(out_event, handles::export_event(delivery)?)?;
        Ok(RTB_OK)
    })
}

/// Take the next event if one is queued, else `RTB_WOULD_BLOCK`
///
/// # Safety
/// `out_event` must be writable.
#[no_mangle]
pub unsafe extern "C" fn rtb_try_next_event(agent: u64, out_event: *mut *mut RtbEvent) -> c_int {
    guard(|| {
        check_out(out_event)?;
        match handles::agent(agent)?.agent.try_next_event()? {
            Some(delivery) => {
                write_out(out_event, handles::export_event(delivery)?)?;
                Ok(RTB_OK)
            }
            None => Ok(RTB_WOULD_BLOCK),
        }
    })
}

/// Wait at most `timeout_ms`, else `RTB_WOULD_BLOCK`
///
/// # Safety
/// `out_event` must be writable.
#[no_mangle]
pub unsafe extern "C" fn rtb_next_event_timeout(agent: u64, timeout_ms: u64, out_event: *mut *mut RtbEvent) -> c_int {
    guard(|| {
        check_out(out_event)?;
        let entry = handles::agent(agent)?;
        match entry.agent.next_event_timeout(Duration::from_millis(timeout_ms))? {
            Some(delivery) => {
                write_out(out_event, handles::export_event(delivery)?)?;
                Ok(RTB_OK)
            }
            None => Ok(RTB_WOULD_BLOCK),
        }
    })
}

/// Deliver the next event to `callback` without blocking the caller.
///
/// When an event (or a terminal error) is already available the callback
/// runs before this function returns; otherwise it runs later on an engine
/// worker thread. A callback still pending when the engine stops is not
/// invoked.
#[no_mangle]
pub extern "C" fn rtb_next_event_async(agent: u64, callback: RtbEventCallback, user_data: *mut c_void) -> c_int {
    guard(|| {
        let entry = handles::agent(agent)?;

        match entry.agent.try_next_event() {
            Ok(Some(delivery)) => complete(callback, user_data, handles::export_event(delivery)),
            Ok(None) => {
                let user = UserData(user_data);
                let runtime = entry.runtime.clone();
                runtime.spawn(async move {
                    let result = entry.agent.next_event_async().await.and_then(handles::export_event);
                    complete(callback, user.into_raw(), result);
                });
            }
            Err(e) => complete(callback, user_data, Err(e)),
        }
        Ok(RTB_OK)
    })
}

fn complete(callback: RtbEventCallback, user_data: *mut c_void, result: Result<*mut RtbEvent>) {
    match result {
        Ok(event) => callback(user_data, RTB_OK, event),
        Err(e) => {
            debug!("Async event request failed: {}", e);
            callback(user_data, e.code(), std::ptr::null_mut());
        }
    }
}

/// Return an event to the engine; freeing twice is `InvalidHandle`
#[no_mangle]
pub extern "C" fn rtb_free_event(event: *mut RtbEvent) -> c_int {
    guard(|| {
        handles::reclaim_event(event)?.free()?;
        Ok(RTB_OK)
    })
}

/// JSON subject of an event, or null for a pointer not currently handed out
#[no_mangle]
pub extern "C" fn rtb_event_json(event: *const RtbEvent) -> *const c_char {
    if !handles::is_live(event) {
        return std::ptr::null();
    }
    // SAFETY: live events stay allocated until `rtb_free_event`
    unsafe { (*event).subject }
}

/// Send a bid response (`RTB_OUT_BID_RESPONSE`) or filter update
/// (`RTB_OUT_CONFIG`) encoded as JSON
///
/// # Safety
/// `json` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rtb_send_event(agent: u64, event_type: c_int, json: *const c_char) -> c_int {
    guard(|| {
        let body = str_arg(json, "json")?;
        let event = match event_type {
            OutboundEvent::BID_RESPONSE => OutboundEvent::BidResponse(serde_json::from_str::<BidResponse>(body)?),
            OutboundEvent::CONFIG => OutboundEvent::Config {
                filter: serde_json::from_str::<ConfigBody>(body)?.filter,
            },
            other => return Err(EngineError::Protocol(format!("unknown outbound event type {}", other))),
        };

        handles::agent(agent)?.agent.send_event(event)?;
        Ok(RTB_OK)
    })
}
