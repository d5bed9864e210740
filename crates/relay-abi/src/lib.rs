//! The C-ABI façade over `relay-core`/`relay-service`/`relay-hosting` for
//! non-Rust language bindings.
//!
//! This crate does no business logic of its own: it is a thin
//! `extern "C"` shim that converts between C-friendly primitives (raw
//! pointers, integer tokens, status codes) and the safe Rust API the
//! rest of the workspace already exposes. Two conventions run through
//! every function here:
//!
//! - every opaque Rust value (a pending or running service, a session)
//!   is addressed by a `u64` token handed back from the call that
//!   created it, never by a raw pointer into Rust-owned memory;
//! - every fallible function returns a [`status::RelayStatus`] as an
//!   `i32` and leaves the full [`relay_core::error::CoreError`] behind
//!   in this thread's last-error slot (`status::relay_last_error_code`/
//!   `relay_last_error_message`) for the caller to retrieve.
//!
//! The outer `Application` object the governing contract describes —
//! "a thin owner of the service manager and config; its only job is to
//! call `Start()`, wait, and call `Stop()`" — is realized here as
//! [`App`], a single process-wide singleton reached through
//! [`app_get`]. A binding only ever needs one.

pub mod component;
pub mod status;

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;

use relay_core::config::{ConfigTree, ConfigValue, ServiceConfig};
use relay_core::error::CoreError;
use relay_core::ids::SessionId;
use relay_core::packet::{Packet, PacketFlags};
use relay_core::poller::Poller;
use relay_core::queue::Envelope;
use relay_hosting::ServiceManager;
use relay_service::{
    ServiceBuilder, ServiceHandle, FFI_CLOSE_TAG, FFI_SEND_TAG,
};

use crate::component::{FfiComponent, RelayComponentVtable};
use crate::status::{guard, RelayStatus};

/// A service that exists only behind this façade has no real transport
/// wired up: a binding that needs sockets composes its own `Poller`
/// (`relay-net-tcp` is the reference one) at the layer that owns a
/// Tokio runtime, which this crate deliberately does not depend on.
/// `send`/`close` both report `Closed` so a misbehaving binding notices
/// immediately rather than silently dropping bytes.
struct FfiNullPoller;

impl Poller for FfiNullPoller {
    fn send(&self, session_id: SessionId, _bytes: Bytes) -> Result<(), CoreError> {
        Err(CoreError::closed(format!(
            "session {session_id} has no transport attached to this façade-hosted service"
        )))
    }

    fn close(&self, _session_id: SessionId) {}

    fn is_open(&self, _session_id: SessionId) -> bool {
        false
    }
}

/// A service token addresses one of these two states. Registration is
/// only legal in `Pending` — mirroring the append-only-during-`Starting`
/// rule §4.F places on the registry itself — and `service_start` is the
/// one transition from `Pending` to `Running`.
enum ServiceSlot {
    Pending(ServiceBuilder),
    Running(ServiceHandle),
}

/// The process-wide singleton: owns the service directory and the
/// table of tokens this façade hands out. Nothing here drives a loop or
/// touches a socket; it is exactly the "thin owner" the governing
/// contract assigns to the outer `Application` object.
pub struct App {
    manager: ServiceManager,
    services: Mutex<HashMap<u64, ServiceSlot>>,
    next_token: AtomicU64,
}

impl App {
    fn new() -> Self {
        Self {
            manager: ServiceManager::new(),
            services: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn global() -> &'static App {
        static APP: OnceLock<App> = OnceLock::new();
        APP.get_or_init(App::new)
    }

    fn running_handle(&self, token: u64) -> Result<ServiceHandle, CoreError> {
        let services = self.services.lock().unwrap_or_else(|p| p.into_inner());
        match services.get(&token) {
            Some(ServiceSlot::Running(handle)) => Ok(handle.clone()),
            Some(ServiceSlot::Pending(_)) => {
                Err(CoreError::state(format!("service {token} has not been started yet")))
            }
            None => Err(CoreError::not_found(format!("no service with token {token}"))),
        }
    }
}

/// Returns the process-wide [`App`] singleton as an opaque pointer.
/// Bindings never dereference it themselves; its only use is as a
/// non-null liveness check and a stable identity to pass back into
/// diagnostics.
#[unsafe(no_mangle)]
pub extern "C" fn app_get() -> *const c_void {
    App::global() as *const App as *const c_void
}

/// # Safety
/// `ptr` must be null or point to a null-terminated, valid UTF-8 C string.
unsafe fn cstr_to_string(ptr: *const c_char) -> Result<String, CoreError> {
    if ptr.is_null() {
        return Err(CoreError::arg("expected a non-null C string"));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(str::to_owned)
        .map_err(|_| CoreError::arg("expected a valid UTF-8 C string"))
}

/// Creates a new service in the `Pending` state and returns its token
/// (nonzero on success, `0` on failure — check `relay_last_error_code`).
/// Components register against this token via
/// [`service_register_component`] until [`service_start`] builds and
/// spawns the loop thread, after which registration is rejected with
/// `State`, the same "append-only during `Starting`" rule §4.F enforces
/// inside the registry itself.
///
/// # Safety
/// `name` must be null or a valid null-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn service_create(
    name: *const c_char,
    fps: i32,
    frame_drain_cap: i32,
    max_session_send_buf: i64,
) -> u64 {
    let (_status, token) = guard(|| {
        let name = unsafe { cstr_to_string(name) }?;
        let tree = ConfigTree::new()
            .with("name", ConfigValue::String(name))
            .with("fps", ConfigValue::Int(fps as i64))
            .with("frameDrainCap", ConfigValue::Int(frame_drain_cap as i64))
            .with("maxSessionSendBuf", ConfigValue::Int(max_session_send_buf));
        let config = ServiceConfig::from_tree(&tree)
            .map_err(|issues| CoreError::arg(format!("invalid service config: {issues:?}")))?;

        let app = App::global();
        let builder = ServiceBuilder::new(config, Arc::new(FfiNullPoller));
        let token = app.next_token.fetch_add(1, Ordering::Relaxed);
        app.services
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(token, ServiceSlot::Pending(builder));
        Ok(token)
    });
    token.unwrap_or(0)
}

/// Registers a component, implemented by `vtable`, against the pending
/// service `service_token`. Fails with `State` once that service has
/// already been started, `NotFound` if the token is unknown, and
/// whatever [`relay_core::component::ComponentRegistry::register`]
/// reports for a duplicate name.
///
/// # Safety
/// `name` must be a valid null-terminated UTF-8 C string. Every
/// non-null function pointer in `vtable` must be safe to call with
/// `vtable.ctx` from the service's own loop thread for as long as the
/// component stays registered.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn service_register_component(
    service_token: u64,
    name: *const c_char,
    vtable: RelayComponentVtable,
) -> i32 {
    let (status, _) = guard(|| {
        let name = unsafe { cstr_to_string(name) }?;
        let component = unsafe { FfiComponent::new(name, vtable) };

        let app = App::global();
        let mut services = app.services.lock().unwrap_or_else(|p| p.into_inner());
        match services.get_mut(&service_token) {
            Some(ServiceSlot::Pending(builder)) => builder.register_component(Arc::new(component)),
            Some(ServiceSlot::Running(_)) => Err(CoreError::state(format!(
                "service {service_token} has already started; cannot register a component"
            ))),
            None => Err(CoreError::not_found(format!("no pending service {service_token}"))),
        }
    });
    status as i32
}

/// Builds and spawns the service `service_token` was created for,
/// handing it to the process-wide [`ServiceManager`]. Idempotent calls
/// (a token already running, or unknown) fail with `State`/`NotFound`
/// respectively rather than spawning a second thread.
#[unsafe(no_mangle)]
pub extern "C" fn service_start(service_token: u64) -> i32 {
    let (status, _) = guard(|| {
        let app = App::global();
        let mut services = app.services.lock().unwrap_or_else(|p| p.into_inner());
        let slot = services
            .remove(&service_token)
            .ok_or_else(|| CoreError::not_found(format!("no pending service {service_token}")))?;

        let builder = match slot {
            ServiceSlot::Pending(builder) => builder,
            ServiceSlot::Running(handle) => {
                services.insert(service_token, ServiceSlot::Running(handle));
                return Err(CoreError::state(format!("service {service_token} already started")));
            }
        };

        let (handle, service) = builder.build();
        let result = app.manager.create(handle.clone(), service);
        services.insert(service_token, ServiceSlot::Running(handle));
        result.map(|_| ())
    });
    status as i32
}

/// Requests that the running service `service_token` stop. Returns
/// immediately; it does not wait for `OnStop` to finish running — a
/// binding that needs a bounded wait should pair this with its own
/// polling of whatever liveness signal it tracks.
#[unsafe(no_mangle)]
pub extern "C" fn service_stop(service_token: u64) -> i32 {
    let (status, _) = guard(|| {
        let handle = App::global().running_handle(service_token)?;
        handle.request_stop();
        Ok(())
    });
    status as i32
}

/// Enqueues a packet for `session_id` on `service_token`'s loop thread,
/// which encodes and flushes it through that service's own `Poller`.
/// `payload`/`payload_len` may be null/`0` for an empty payload.
///
/// # Safety
/// If non-null, `payload` must point to at least `payload_len` readable
/// bytes for the duration of this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn service_send_packet(
    service_token: u64,
    session_id: u64,
    opcode: u32,
    serial: u64,
    status_code: i32,
    flags: u16,
    payload: *const u8,
    payload_len: usize,
) -> i32 {
    let (status, _) = guard(|| {
        let handle = App::global().running_handle(service_token)?;
        let payload = if payload.is_null() || payload_len == 0 {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(payload, payload_len) })
        };
        let packet = Packet::new(opcode, serial, session_id, payload)
            .with_status(status_code)
            .with_flags(PacketFlags::from_bits_truncate(flags));
        let request = relay_service::FfiSendRequest {
            session_id: SessionId::from_raw(session_id),
            packet,
        };
        handle.post_message(Envelope::new(FFI_SEND_TAG, request))
    });
    status as i32
}

/// Requests that `session_id` on `service_token` be closed. Handled on
/// the service's own loop thread, the same as every other session
/// transition.
#[unsafe(no_mangle)]
pub extern "C" fn session_close(service_token: u64, session_id: u64) -> i32 {
    let (status, _) = guard(|| {
        let handle = App::global().running_handle(service_token)?;
        let request = relay_service::FfiCloseRequest {
            session_id: SessionId::from_raw(session_id),
        };
        handle.post_message(Envelope::new(FFI_CLOSE_TAG, request))
    });
    status as i32
}

/// Writes one structured log event through this process's `tracing`
/// subscriber. `level` follows the same ordering a binding's own log
/// levels typically use: `0` = error, `1` = warn, `2` = info (default
/// for any other value), `3` = debug, `4` = trace.
///
/// # Safety
/// `target` and `message` must be valid null-terminated UTF-8 C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn log_write(level: i32, target: *const c_char, message: *const c_char) -> i32 {
    let (status, _) = guard(|| {
        let target = unsafe { cstr_to_string(target) }?;
        let message = unsafe { cstr_to_string(message) }?;
        match level {
            0 => tracing::error!(caller_target = %target, "{message}"),
            1 => tracing::warn!(caller_target = %target, "{message}"),
            3 => tracing::debug!(caller_target = %target, "{message}"),
            4 => tracing::trace!(caller_target = %target, "{message}"),
            _ => tracing::info!(caller_target = %target, "{message}"),
        }
        Ok(())
    });
    status as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn cstring(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn create_register_start_then_reject_late_registration() {
        let name = cstring("abi-lifecycle");
        let token = unsafe { service_create(name.as_ptr(), 1000, 64, 1024 * 1024) };
        assert_ne!(token, 0);

        let vtable = RelayComponentVtable {
            on_init: None,
            on_start: None,
            on_update: None,
            on_stop: None,
            on_destroy: None,
            on_message: None,
            ctx: std::ptr::null_mut(),
        };
        let comp_name = cstring("noop");
        let status = unsafe { service_register_component(token, comp_name.as_ptr(), vtable) };
        assert_eq!(status, RelayStatus::Ok as i32);

        assert_eq!(service_start(token), RelayStatus::Ok as i32);
        assert_eq!(service_start(token), RelayStatus::State as i32);

        let late_vtable = RelayComponentVtable {
            on_init: None,
            on_start: None,
            on_update: None,
            on_stop: None,
            on_destroy: None,
            on_message: None,
            ctx: std::ptr::null_mut(),
        };
        let late_name = cstring("too-late");
        let status = unsafe { service_register_component(token, late_name.as_ptr(), late_vtable) };
        assert_eq!(status, RelayStatus::State as i32);

        assert_eq!(service_stop(token), RelayStatus::Ok as i32);
    }

    #[test]
    fn unknown_token_is_not_found() {
        assert_eq!(service_stop(u64::MAX), RelayStatus::NotFound as i32);
        let status = unsafe { session_close(u64::MAX, 1) };
        assert_eq!(status, RelayStatus::NotFound as i32);
    }

    #[test]
    fn send_on_a_pending_service_reports_wrong_state() {
        let name = cstring("abi-pending");
        let token = unsafe { service_create(name.as_ptr(), 1000, 64, 1024 * 1024) };
        let status = unsafe { service_send_packet(token, 1, 0x10, 1, 0, 0, std::ptr::null(), 0) };
        assert_eq!(status, RelayStatus::State as i32);
    }

    #[test]
    fn app_get_is_a_stable_non_null_singleton() {
        let a = app_get();
        let b = app_get();
        assert!(!a.is_null());
        assert_eq!(a, b);
    }

    #[test]
    fn log_write_accepts_every_level() {
        let target = cstring("abi::tests");
        let message = cstring("hello from a binding");
        for level in 0..5 {
            let status = unsafe { log_write(level, target.as_ptr(), message.as_ptr()) };
            assert_eq!(status, RelayStatus::Ok as i32);
        }
    }
}
