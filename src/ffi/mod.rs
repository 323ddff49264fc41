// src/ffi/mod.rs
//! C ABI
//!
//! Engines and agents are exposed as opaque 64-bit handles; `0` is never a
//! valid handle. Events are heap blocks owned by the caller until passed
//! to `rtb_free_event`. Every function returns a status code:
//!
//! ```text
//!   0  RTB_OK
//!   1  RTB_WOULD_BLOCK      (try / timeout variants, nothing queued)
//!  <0  error, see EngineError::code(); details via rtb_last_error()
//! ```
//!
//! The error message is kept per thread and stays valid until the next
//! failing call on that thread.

pub mod exports;
mod handles;

use crate::utils::errors::{EngineError, Result};
use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

pub const RTB_OK: c_int = 0;
pub const RTB_WOULD_BLOCK: c_int = 1;

/// Returned when a call panicked; the panic never crosses the boundary
pub const RTB_ERR_PANIC: c_int = -99;

thread_local! {
    static LAST_ERROR: RefCell<Option<(c_int, CString)>> = const { RefCell::new(None) };
}

fn set_last_error(code: c_int, message: &str) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some((code, message)));
}

/// Run `f`, turning errors and panics into status codes
pub(crate) fn guard(f: impl FnOnce() -> Result<c_int>) -> c_int {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            set_last_error(e.code(), &e.to_string());
            e.code()
        }
        Err(_) => {
            error!("Panic caught at the C boundary");
            set_last_error(RTB_ERR_PANIC, "internal panic");
            RTB_ERR_PANIC
        }
    }
}

/// Borrow a C string argument as UTF-8
pub(crate) unsafe fn str_arg<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(EngineError::InvalidHandle(format!("{} is null", what)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|e| EngineError::Protocol(format!("{} is not UTF-8: {}", what, e)))
}

/// Message of the last failed call on this thread, or null
#[no_mangle]
pub extern "C" fn rtb_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| match &*slot.borrow() {
        Some((_, message)) => message.as_ptr(),
        None => std::ptr::null(),
    })
}

/// Code of the last failed call on this thread, or `RTB_OK`
#[no_mangle]
pub extern "C" fn rtb_last_error_code() -> c_int {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map(|(code, _)| *code).unwrap_or(RTB_OK))
}
