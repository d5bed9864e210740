//! Reference-counted objects and thread-local auto-release pools.
//!
//! The owning refcount is realized directly as `Arc`'s strong count:
//! `retain`/`release` are `Arc::clone`/`drop`, and `Arc`'s own decrement
//! already uses release-on-decrement, acquire-on-the-final-decrement
//! ordering — exactly the invariant §5 asks for — so `safe_retain` and
//! `safe_release` are thin, documented aliases rather than a second
//! counting mechanism. What this module actually adds on top of `Arc` is
//! the auto-release side: a thread-local LIFO stack of pool frames that
//! can hold extra clones alive until a well-defined drain point, so
//! handler code can hand back freshly built objects without following a
//! synchronous disposal discipline at every call site.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

use crate::error::CoreError;

struct ObjectHeader {
    auto_ref: std::sync::atomic::AtomicUsize,
}

struct ObjectInner<T> {
    header: ObjectHeader,
    value: T,
}

/// A reference-counted handle, retained via `Arc` under the hood.
///
/// `ref_count` tracks the owning side; `auto_ref_count` tracks how many
/// live enlistments this object currently has in auto-release pools
/// (possibly on several different pool frames on this thread). The
/// invariant `ref_count() >= auto_ref_count() >= 0` holds because every
/// enlistment holds one of the clones counted in `ref_count`.
pub struct Object<T> {
    inner: Arc<ObjectInner<T>>,
}

impl<T> Clone for Object<T> {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl<T: 'static + Send + Sync> Object<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                header: ObjectHeader {
                    auto_ref: std::sync::atomic::AtomicUsize::new(0),
                },
                value,
            }),
        }
    }

    pub fn retain(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn release(self) {
        drop(self);
    }

    /// Alias for [`retain`](Self::retain) used at call sites where the
    /// object may cross a thread boundary before being released. `Arc`'s
    /// clone is already safe for that; the alias exists for readability
    /// at the handoff point, not for a different counting discipline.
    pub fn safe_retain(&self) -> Self {
        self.retain()
    }

    /// Alias for [`release`](Self::release); see [`safe_retain`](Self::safe_retain).
    pub fn safe_release(self) {
        self.release()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn auto_ref_count(&self) -> usize {
        self.inner
            .header
            .auto_ref
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Enlists a clone of this object in the top frame of the calling
    /// thread's auto-release pool stack. Does not consume `self`; the
    /// caller keeps using its own handle, while the pool-held clone keeps
    /// the value alive until [`AutoReleasePool::drain`] runs.
    ///
    /// Returns [`ErrorKind::State`](crate::error::ErrorKind::State) if no
    /// pool is active on this thread. This crate never creates a pool
    /// implicitly — callers must push one with [`AutoReleasePool::new`].
    pub fn auto_release(&self) -> Result<(), CoreError> {
        enlist(self.retain())?;
        self.inner
            .header
            .auto_ref
            .fetch_add(1, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    pub fn get(&self) -> &T {
        &self.inner.value
    }
}

impl<T> std::ops::Deref for Object<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

/// A guard dropped by the pool drain logic; dropping it decrements the
/// object's `auto_ref` counter and then drops the held clone (the actual
/// `Release`).
struct AutoReleaseGuard<T: 'static> {
    obj: Object<T>,
}

impl<T: 'static> Drop for AutoReleaseGuard<T> {
    fn drop(&mut self) {
        self.obj
            .inner
            .header
            .auto_ref
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    }
}

type PoolFrame = Vec<Box<dyn Any>>;

thread_local! {
    static POOL_STACK: RefCell<Vec<PoolFrame>> = const { RefCell::new(Vec::new()) };
}

fn enlist<T: 'static + Send + Sync>(obj: Object<T>) -> Result<(), CoreError> {
    POOL_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last_mut() {
            Some(frame) => {
                frame.push(Box::new(AutoReleaseGuard { obj }));
                Ok(())
            }
            None => Err(CoreError::state(
                "auto_release called with no active pool on this thread",
            )),
        }
    })
}

/// A LIFO stack frame of objects whose release is deferred until the
/// frame drains.
///
/// Pushing (`new`) and popping (`Drop`) are strictly nested per thread —
/// frames are plain stack discipline, so the only way to violate nesting
/// is to outlive a parent frame's lexical scope, which borrowck already
/// prevents for the common case of holding the guard in a local binding.
pub struct AutoReleasePool {
    _no_send_sync: std::marker::PhantomData<*const ()>,
}

impl AutoReleasePool {
    /// Pushes a new, empty frame onto this thread's pool stack.
    pub fn new() -> Self {
        POOL_STACK.with(|stack| stack.borrow_mut().push(Vec::new()));
        Self {
            _no_send_sync: std::marker::PhantomData,
        }
    }

    /// Releases every object enlisted in the *top* frame since the last
    /// drain, in reverse insertion order, without popping the frame
    /// itself. This is what the service loop calls once per tick.
    pub fn drain() -> usize {
        POOL_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last_mut() {
                Some(frame) => {
                    let mut taken = std::mem::take(frame);
                    let count = taken.len();
                    while let Some(entry) = taken.pop() {
                        drop(entry);
                    }
                    count
                }
                None => 0,
            }
        })
    }

    /// Depth of the pool stack on the calling thread; exposed for tests.
    pub fn depth() -> usize {
        POOL_STACK.with(|stack| stack.borrow().len())
    }
}

impl Default for AutoReleasePool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AutoReleasePool {
    fn drop(&mut self) {
        POOL_STACK.with(|stack| {
            if let Some(mut frame) = stack.borrow_mut().pop() {
                while let Some(entry) = frame.pop() {
                    drop(entry);
                }
            }
        });
    }
}
