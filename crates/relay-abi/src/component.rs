//! Wraps a caller-supplied C vtable of function pointers as a
//! [`relay_core::component::Component`], the same "guest implements a
//! small struct of callbacks, host drives its lifecycle" shape a
//! minimal C-ABI plugin entry point uses.
//!
//! `ctx` is an opaque pointer the caller owns; this module never
//! dereferences it, only threads it through to the callbacks unchanged.

use std::ffi::{c_char, c_void, CString};

use relay_core::component::Component;
use relay_core::error::CoreError;
use relay_core::queue::Envelope;

/// The callback table a C caller fills in before calling
/// `relay_service_register_component`. Any entry may be null to accept
/// that lifecycle stage's default (a no-op success).
#[repr(C)]
pub struct RelayComponentVtable {
    pub on_init: Option<extern "C" fn(ctx: *mut c_void) -> i32>,
    pub on_start: Option<extern "C" fn(ctx: *mut c_void) -> i32>,
    pub on_update: Option<extern "C" fn(ctx: *mut c_void, dt_ms: u64)>,
    pub on_stop: Option<extern "C" fn(ctx: *mut c_void) -> i32>,
    pub on_destroy: Option<extern "C" fn(ctx: *mut c_void)>,
    pub on_message: Option<
        extern "C" fn(ctx: *mut c_void, tag: *const c_char, payload: *const u8, payload_len: usize),
    >,
    pub ctx: *mut c_void,
}

/// `ctx` is whatever the caller on the other side of the ABI decided to
/// make it; this crate has no way to verify it is actually safe to
/// share across threads, so the caller is the one making that promise
/// by registering the component at all. Every relay-service component
/// callback runs on that one service's own loop thread, never
/// concurrently with another callback from the same component, which
/// is the same single-threaded guarantee a same-thread C context
/// pointer needs.
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

pub struct FfiComponent {
    name: String,
    vtable: RelayComponentVtable,
    ctx: SendPtr,
}

impl FfiComponent {
    /// # Safety
    /// Every non-null function pointer in `vtable` must be safe to call
    /// with `vtable.ctx` for as long as the resulting component stays
    /// registered, from the service's loop thread.
    pub unsafe fn new(name: String, vtable: RelayComponentVtable) -> Self {
        let ctx = SendPtr(vtable.ctx);
        Self { name, vtable, ctx }
    }
}

fn status_to_result(code: i32) -> Result<(), CoreError> {
    if code == 0 {
        Ok(())
    } else {
        Err(CoreError::internal(format!(
            "ffi component callback returned non-zero status {code}"
        )))
    }
}

impl Component for FfiComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_init(&self) -> Result<(), CoreError> {
        match self.vtable.on_init {
            Some(f) => status_to_result(f(self.ctx.0)),
            None => Ok(()),
        }
    }

    fn on_start(&self) -> Result<(), CoreError> {
        match self.vtable.on_start {
            Some(f) => status_to_result(f(self.ctx.0)),
            None => Ok(()),
        }
    }

    fn on_update(&self, dt_ms: u64) {
        if let Some(f) = self.vtable.on_update {
            f(self.ctx.0, dt_ms);
        }
    }

    fn on_stop(&self) -> Result<(), CoreError> {
        match self.vtable.on_stop {
            Some(f) => status_to_result(f(self.ctx.0)),
            None => Ok(()),
        }
    }

    fn on_destroy(&self) {
        if let Some(f) = self.vtable.on_destroy {
            f(self.ctx.0);
        }
    }

    fn on_message(&self, envelope: &Envelope) {
        let Some(f) = self.vtable.on_message else {
            return;
        };
        // Only plain byte-carrying envelopes (everything this façade
        // itself posts, and anything a binding posts via
        // `relay_service_post_message`) can cross into C; anything else
        // queued internally (poller events, stop/ffi control envelopes)
        // never reaches a component's `on_message` at all, so there is
        // nothing to downcast here but `Vec<u8>`.
        let Ok(tag) = CString::new(envelope.tag.as_str()) else {
            return;
        };
        if let Some(bytes) = envelope.payload.downcast_ref::<Vec<u8>>() {
            f(self.ctx.0, tag.as_ptr(), bytes.as_ptr(), bytes.len());
        } else {
            f(self.ctx.0, tag.as_ptr(), std::ptr::null(), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    extern "C" fn record_init(ctx: *mut c_void) -> i32 {
        let counter = unsafe { &*(ctx as *const AtomicI32) };
        counter.fetch_add(1, Ordering::SeqCst);
        0
    }

    #[test]
    fn missing_callbacks_default_to_success() {
        let vtable = RelayComponentVtable {
            on_init: None,
            on_start: None,
            on_update: None,
            on_stop: None,
            on_destroy: None,
            on_message: None,
            ctx: std::ptr::null_mut(),
        };
        let component = unsafe { FfiComponent::new("noop".into(), vtable) };
        assert!(component.on_init().is_ok());
        assert!(component.on_start().is_ok());
        assert!(component.on_stop().is_ok());
    }

    #[test]
    fn present_callback_runs_against_the_supplied_ctx() {
        let counter = AtomicI32::new(0);
        let vtable = RelayComponentVtable {
            on_init: Some(record_init),
            on_start: None,
            on_update: None,
            on_stop: None,
            on_destroy: None,
            on_message: None,
            ctx: &counter as *const AtomicI32 as *mut c_void,
        };
        let component = unsafe { FfiComponent::new("counting".into(), vtable) };
        component.on_init().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
