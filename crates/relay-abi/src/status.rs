//! Status codes and the thread-local last-error slot.
//!
//! This is the only place in the whole workspace that touches a
//! thread-local error cell — every other crate propagates `CoreError`
//! with `?` and never consults one. A C caller has no `Result` to
//! inspect, so each façade function instead returns a [`RelayStatus`]
//! and, on failure, leaves the full error behind here for
//! `relay_last_error_message`/`relay_last_error_code` to retrieve.

use std::cell::RefCell;

use relay_core::error::{CoreError, ErrorKind};

/// Mirrors [`ErrorKind`] as a stable, `#[repr(i32)]` wire value: the
/// ordering here is an ABI commitment once a binding depends on it, so
/// new kinds are appended, never inserted.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayStatus {
    Ok = 0,
    Arg = 1,
    NotFound = 2,
    Repeat = 3,
    State = 4,
    ProtocolError = 5,
    WouldBlock = 6,
    Closed = 7,
    Timeout = 8,
    Internal = 9,
}

impl From<ErrorKind> for RelayStatus {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Arg => RelayStatus::Arg,
            ErrorKind::NotFound => RelayStatus::NotFound,
            ErrorKind::Repeat => RelayStatus::Repeat,
            ErrorKind::State => RelayStatus::State,
            ErrorKind::ProtocolError => RelayStatus::ProtocolError,
            ErrorKind::WouldBlock => RelayStatus::WouldBlock,
            ErrorKind::Closed => RelayStatus::Closed,
            ErrorKind::Timeout => RelayStatus::Timeout,
            // `ErrorKind` is `#[non_exhaustive]`; anything added on the
            // Rust side that this façade doesn't know about yet is
            // reported as `Internal` rather than failing to compile.
            _ => RelayStatus::Internal,
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CoreError>> = const { RefCell::new(None) };
}

/// Records `err` as this thread's last error and returns the
/// [`RelayStatus`] a façade function should return for it.
pub(crate) fn set_last_error(err: CoreError) -> RelayStatus {
    let status = RelayStatus::from(err.kind());
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
    status
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Runs `f`; on `Err`, records the error for this thread and returns the
/// corresponding status. On `Ok`, clears any stale error left over from
/// a previous failed call on this thread and returns `Ok`.
pub(crate) fn guard<T>(f: impl FnOnce() -> Result<T, CoreError>) -> (RelayStatus, Option<T>) {
    match f() {
        Ok(value) => {
            clear_last_error();
            (RelayStatus::Ok, Some(value))
        }
        Err(err) => (set_last_error(err), None),
    }
}

/// Returns this thread's last recorded error code, or `Ok` if none is
/// set (either nothing has failed yet, or the last call succeeded).
#[unsafe(no_mangle)]
pub extern "C" fn relay_last_error_code() -> i32 {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|err| RelayStatus::from(err.kind()) as i32)
            .unwrap_or(RelayStatus::Ok as i32)
    })
}

/// Writes this thread's last error message, UTF-8, into `buf` (capacity
/// `cap` bytes), truncating if necessary, and always null-terminating
/// when `cap > 0`. Returns the untruncated message length in bytes, or
/// 0 if there is no recorded error. Passing a null `buf` (or `cap == 0`)
/// is how a caller discovers the required buffer size.
///
/// # Safety
/// `buf` must be either null or point to at least `cap` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_last_error_message(buf: *mut u8, cap: usize) -> usize {
    LAST_ERROR.with(|slot| {
        let borrowed = slot.borrow();
        let Some(err) = borrowed.as_ref() else {
            return 0;
        };
        let message = err.to_string();
        let bytes = message.as_bytes();
        if buf.is_null() || cap == 0 {
            return bytes.len();
        }
        let write_len = bytes.len().min(cap - 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, write_len);
            *buf.add(write_len) = 0;
        }
        bytes.len()
    })
}
