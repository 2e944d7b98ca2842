//! Pinning of host callbacks across native calls.
//!
//! Native code only sees an opaque `*mut c_void` closure. It must stay valid
//! for the whole native call that may invoke it, and must not outlive it.
//! [ClosureRegistry::register] moves the callback's [EventMarshaler] to the
//! heap so its address is stable, and the returned [PendingCallback] frees it
//! on drop, on every exit path.

use std::any::Any;
use std::cell::Cell;
use std::ffi::c_void;
use std::fmt::{self, Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use tracing::trace;

use crate::common::{Event, Id, ID_SIZE};

/// Host callback receiving every event of a native call, with its info hash.
pub type EventCallback<'a> = dyn FnMut(&Id, Event) + 'a;

/// Decodes raw engine notifications and hands them to the host callback.
pub struct EventMarshaler<'a> {
    callback: &'a mut EventCallback<'a>,
    delivered: usize,
    panic: Option<Box<dyn Any + Send>>,
}

impl<'a> EventMarshaler<'a> {
    fn new(callback: &'a mut EventCallback<'a>) -> Self {
        EventMarshaler {
            callback,
            delivered: 0,
            panic: None,
        }
    }

    /// Handle one notification. Unknown codes are ignored.
    ///
    /// A panicking callback must not unwind through native frames: the panic is
    /// kept until the native call returns, and later notifications are dropped.
    pub fn on_event(&mut self, code: i32, info_hash: &[u8; ID_SIZE], payload: &[u8]) {
        if self.panic.is_some() {
            return;
        }

        let event = match Event::from_raw(code, payload) {
            Some(event) => event,
            None => {
                trace!(code, "Ignoring unknown engine event");
                return;
            }
        };

        let info_hash = Id(*info_hash);
        let callback = &mut *self.callback;

        match panic::catch_unwind(AssertUnwindSafe(|| callback(&info_hash, event))) {
            Ok(()) => self.delivered += 1,
            Err(panic) => self.panic = Some(panic),
        }
    }
}

#[derive(Debug, Default)]
/// Tracks the callbacks currently pinned for native calls.
pub struct ClosureRegistry {
    outstanding: Cell<usize>,
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `callback` for the duration of one native call.
    pub fn register<'r, 'a>(&'r self, callback: &'a mut EventCallback<'a>) -> PendingCallback<'r, 'a> {
        let marshaler = Box::new(EventMarshaler::new(callback));

        self.outstanding.set(self.outstanding.get() + 1);

        PendingCallback {
            registry: self,
            marshaler: NonNull::from(Box::leak(marshaler)),
        }
    }

    /// Unpin a callback. Same as dropping the handle.
    pub fn release(&self, handle: PendingCallback<'_, '_>) {
        debug_assert!(std::ptr::eq(handle.registry, self));
        drop(handle)
    }

    /// Number of callbacks currently pinned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }
}

/// A callback pinned for a native call, released on drop.
pub struct PendingCallback<'r, 'a> {
    registry: &'r ClosureRegistry,
    marshaler: NonNull<EventMarshaler<'a>>,
}

impl<'r, 'a> PendingCallback<'r, 'a> {
    /// Opaque closure pointer to hand to native code.
    ///
    /// Only valid while this handle is alive.
    pub fn closure(&self) -> *mut c_void {
        self.marshaler.as_ptr().cast()
    }

    /// Deliver a raw notification to the pinned callback.
    pub fn deliver(&mut self, code: i32, info_hash: &[u8; ID_SIZE], payload: &[u8]) {
        // SAFETY: the marshaler is owned by this handle until drop.
        unsafe { self.marshaler.as_mut() }.on_event(code, info_hash, payload)
    }

    /// Deliver a raw notification through a pointer from [PendingCallback::closure].
    ///
    /// # Safety
    ///
    /// `closure` must come from [PendingCallback::closure] of a handle that is
    /// still alive, and no other reference to its marshaler may be in use.
    pub unsafe fn deliver_raw(
        closure: *mut c_void,
        code: i32,
        info_hash: &[u8; ID_SIZE],
        payload: &[u8],
    ) {
        let marshaler = &mut *closure.cast::<EventMarshaler<'_>>();
        marshaler.on_event(code, info_hash, payload)
    }

    /// Number of events handed to the callback so far.
    pub fn delivered(&self) -> usize {
        // SAFETY: see `deliver`.
        unsafe { self.marshaler.as_ref() }.delivered
    }

    /// Take the panic raised by the callback, if any.
    pub(crate) fn take_panic(&mut self) -> Option<Box<dyn Any + Send>> {
        // SAFETY: see `deliver`.
        unsafe { self.marshaler.as_mut() }.panic.take()
    }
}

impl Drop for PendingCallback<'_, '_> {
    fn drop(&mut self) {
        // SAFETY: the pointer was leaked from a Box in `register`, and is only
        // reclaimed here, once.
        drop(unsafe { Box::from_raw(self.marshaler.as_ptr()) });

        self.registry.outstanding.set(self.registry.outstanding.get() - 1);
    }
}

impl Debug for PendingCallback<'_, '_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PendingCallback({:p})", self.marshaler)
    }
}
