// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-object event recording: debug logging of every operation on a mutex or condvar, and
//! user-supplied invariants checked whenever a mutex changes hands.
//!
//! Attaching a record to an object sets its `EVENT` bit, which diverts every operation on the
//! object onto its slow path, where events are posted.

use alloc::boxed::Box;
use alloc::string::String;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use bitflags::bitflags;

use super::{CONFIG_STACK_DEPTH, RawSyncPrimitivesProvider};

static CHECK_INVARIANTS: AtomicBool = AtomicBool::new(false);

/// Enable or disable checking of invariants registered with
/// [`Mutex::enable_invariant_debugging`](super::Mutex::enable_invariant_debugging).
///
/// Invariants registered while checking is disabled are ignored.
pub fn enable_invariant_checking(enabled: bool) {
    CHECK_INVARIANTS.store(enabled, Ordering::Release);
}

pub(crate) fn invariant_checking_enabled() -> bool {
    CHECK_INVARIANTS.load(Ordering::Acquire)
}

bitflags! {
    /// What an event says about the state of its object.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct EventProperties: u8 {
        /// The mutex is write-held after (or, for unlocks, before) the event.
        const LOCKED_WRITE = 1 << 0;
        /// The mutex is read-held after (or, for unlocks, before) the event.
        const LOCKED_READ = 1 << 1;
        /// The event was a try-lock.
        const TRY = 1 << 2;
        /// The event is a release.
        const UNLOCK = 1 << 3;
    }
}

/// Events posted on objects with event recording enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncEventKind {
    TryLockSuccess,
    TryLockFailed,
    ReaderTryLockSuccess,
    ReaderTryLockFailed,
    Lock,
    LockReturning,
    ReaderLock,
    ReaderLockReturning,
    Unlock,
    ReaderUnlock,
    Wait,
    WaitReturning,
    Signal,
    SignalAll,
}

impl SyncEventKind {
    fn message(self) -> &'static str {
        match self {
            Self::TryLockSuccess => "TryLock succeeded ",
            Self::TryLockFailed => "TryLock failed ",
            Self::ReaderTryLockSuccess => "ReaderTryLock succeeded ",
            Self::ReaderTryLockFailed => "ReaderTryLock failed ",
            Self::Lock => "Lock blocking ",
            Self::LockReturning => "Lock returning ",
            Self::ReaderLock => "ReaderLock blocking ",
            Self::ReaderLockReturning => "ReaderLock returning ",
            Self::Unlock => "Unlock ",
            Self::ReaderUnlock => "ReaderUnlock ",
            Self::Wait => "Wait on ",
            Self::WaitReturning => "Wait unblocked ",
            Self::Signal => "Signal on ",
            Self::SignalAll => "SignalAll on ",
        }
    }

    pub(crate) fn properties(self) -> EventProperties {
        match self {
            Self::TryLockSuccess => EventProperties::LOCKED_WRITE | EventProperties::TRY,
            Self::ReaderTryLockSuccess => EventProperties::LOCKED_READ | EventProperties::TRY,
            Self::LockReturning => EventProperties::LOCKED_WRITE,
            Self::ReaderLockReturning => EventProperties::LOCKED_READ,
            Self::Unlock => EventProperties::LOCKED_WRITE | EventProperties::UNLOCK,
            Self::ReaderUnlock => EventProperties::LOCKED_READ | EventProperties::UNLOCK,
            Self::TryLockFailed
            | Self::ReaderTryLockFailed
            | Self::Lock
            | Self::ReaderLock
            | Self::Wait
            | Self::WaitReturning
            | Self::Signal
            | Self::SignalAll => EventProperties::empty(),
        }
    }
}

/// Debugging state attached to a single mutex or condvar.
pub(crate) struct SyncEvent {
    name: spin::Mutex<String>,
    log: AtomicBool,
    invariant: spin::Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl SyncEvent {
    fn new() -> Self {
        Self {
            name: spin::Mutex::new(String::new()),
            log: AtomicBool::new(false),
            invariant: spin::Mutex::new(None),
        }
    }

    pub(crate) fn set_name(&self, name: &str) {
        let mut n = self.name.lock();
        n.clear();
        n.push_str(name);
    }

    pub(crate) fn set_log(&self, log: bool) {
        self.log.store(log, Ordering::Relaxed);
    }

    pub(crate) fn set_invariant(&self, invariant: Box<dyn Fn() + Send + Sync>) {
        *self.invariant.lock() = Some(invariant);
    }

    pub(crate) fn with_name<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(&self.name.lock())
    }
}

/// The (lazily created) event record slot of an object.
pub(crate) struct EventSlot(AtomicPtr<SyncEvent>);

impl EventSlot {
    pub(crate) const fn new() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    pub(crate) fn get(&self) -> Option<&SyncEvent> {
        // SAFETY: a published record is only freed by `Drop`, which has exclusive access.
        unsafe { self.0.load(Ordering::Acquire).as_ref() }
    }

    /// The record of this object, created if necessary.
    pub(crate) fn ensure(&self) -> &SyncEvent {
        if let Some(e) = self.get() {
            return e;
        }
        let fresh = Box::into_raw(Box::new(SyncEvent::new()));
        match self.0.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // SAFETY: we just published `fresh`; it lives as long as `self`.
            Ok(_) => unsafe { &*fresh },
            Err(existing) => {
                // SAFETY: `fresh` was never published.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: as in `get`.
                unsafe { &*existing }
            }
        }
    }

    /// Name recorded for this object, or the empty string.
    pub(crate) fn name<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        match self.get() {
            Some(e) => e.with_name(f),
            None => f(""),
        }
    }
}

impl Drop for EventSlot {
    fn drop(&mut self) {
        let p = *self.0.get_mut();
        if !p.is_null() {
            // SAFETY: `p` came from `Box::into_raw` in `ensure`, and nobody else can hold it now.
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

/// Set `bits` in `word`, waiting for `wait_until_clear` to be clear first.
pub(crate) fn set_bits_when_clear(word: &AtomicUsize, bits: usize, wait_until_clear: usize) {
    let mut v = word.load(Ordering::Relaxed);
    loop {
        if v & bits == bits {
            return;
        }
        if v & wait_until_clear != 0 {
            core::hint::spin_loop();
            v = word.load(Ordering::Relaxed);
            continue;
        }
        match word.compare_exchange_weak(v, v | bits, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => v = actual,
        }
    }
}

/// Post `kind` on the object at `addr`: log it if logging is enabled for the object, and run
/// the mutex invariant if the object is a locked mutex.
pub(crate) fn post_sync_event<Platform: RawSyncPrimitivesProvider>(
    platform: &Platform,
    slot: &EventSlot,
    addr: usize,
    kind: SyncEventKind,
) {
    let event = slot.get();
    // Logging is on if event recording is on and either there's no record (yet), or it
    // explicitly says to log.
    if event.is_none_or(|e| e.log.load(Ordering::Relaxed)) {
        let stack = platform.capture_stack(CONFIG_STACK_DEPTH);
        slot.name(|name| {
            debug_log_println!(platform, "{}{addr:#x} {name} @ {stack}", kind.message());
        });
    }
    let Some(event) = event else {
        return;
    };
    if kind
        .properties()
        .intersects(EventProperties::LOCKED_WRITE | EventProperties::LOCKED_READ)
    {
        if let Some(invariant) = event.invariant.lock().as_ref() {
            invariant();
        }
    }
}
