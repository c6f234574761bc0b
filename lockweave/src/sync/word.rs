// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The lock word: a single `usize` encoding a mutex's full observable state.
//!
//! The low byte holds the status bits below. The remaining high bits form a tagged union,
//! selected by [`WAIT`]:
//!
//! - [`WAIT`] clear: the number of readers holding the lock, in units of [`ONE`].
//! - [`WAIT`] set: the address of the queue head, the most recently queued [`ThreadSlot`]. Slots
//!   are aligned to 256 bytes, so their low byte is always zero.
//!
//! When the head pointer occupies the high bits, the reader count moves into the head's
//! `readers` field instead.

use super::thread_slot::ThreadSlot;
use crate::platform::ThreadProvider;

/// At least one reader holds the lock.
pub(crate) const READER: usize = 0x0001;
/// A designated waker exists; other releasers need not wake anyone.
pub(crate) const DESIG: usize = 0x0002;
/// The waiter queue is non-empty.
pub(crate) const WAIT: usize = 0x0004;
/// A writer holds the lock.
pub(crate) const WRITER: usize = 0x0008;
/// Event recording is enabled for this mutex.
pub(crate) const EVENT: usize = 0x0010;
/// A runnable writer is waiting behind readers.
pub(crate) const WRWAIT: usize = 0x0020;
/// The internal spinlock guarding the waiter queue is held.
pub(crate) const SPIN: usize = 0x0040;

/// Mask of the status bits.
pub(crate) const LOW: usize = 0x00ff;
/// Mask of the reader-count-or-head-pointer bits.
pub(crate) const HIGH: usize = !LOW;
/// One reader, as counted in the high bits.
pub(crate) const ONE: usize = 0x0100;

/// The two acquisition modes of a mutex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockMode {
    Exclusive,
    Shared,
}

/// Per-mode constants driving the acquisition state machine.
pub(crate) struct ModeTable {
    /// Bits that must be clear for the fast path.
    pub(crate) fast_need_zero: usize,
    /// Bits or-ed in by a successful acquisition.
    pub(crate) fast_or: usize,
    /// Amount added to the word by a successful acquisition.
    pub(crate) fast_add: usize,
    /// Bits that must be clear to acquire inside the slow loop.
    pub(crate) slow_need_zero: usize,
    /// Bits that must be clear to bump a reader count stored in the queue head.
    pub(crate) slow_inc_need_zero: usize,
}

const EXCLUSIVE: ModeTable = ModeTable {
    fast_need_zero: WRITER | READER | EVENT,
    fast_or: WRITER,
    fast_add: 0,
    slow_need_zero: WRITER | READER,
    slow_inc_need_zero: !0,
};

const SHARED: ModeTable = ModeTable {
    fast_need_zero: WRITER | WAIT | EVENT,
    fast_or: READER,
    fast_add: ONE,
    slow_need_zero: WRITER | WAIT,
    slow_inc_need_zero: SPIN | WRITER | WRWAIT,
};

impl LockMode {
    pub(crate) const fn table(self) -> &'static ModeTable {
        match self {
            LockMode::Exclusive => &EXCLUSIVE,
            LockMode::Shared => &SHARED,
        }
    }

    /// The mode currently held, as visible from a locked word.
    pub(crate) const fn held_in(v: usize) -> Self {
        if is_writer_locked(v) {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }
}

/// Mask applied to the word on (re)acquisition: a woken waiter clears the designated waker bit
/// because it was the designated waker.
pub(crate) const fn clear_designated_waker_mask(has_blocked: bool) -> usize {
    if has_blocked { !DESIG } else { !0 }
}

/// Mask applied when checking for waiting writers: a woken waiter ignores `WRWAIT`, which may
/// well have been set on its behalf.
pub(crate) const fn ignore_waiting_writers_mask(has_blocked: bool) -> usize {
    if has_blocked { !WRWAIT } else { !0 }
}

pub(crate) const fn is_writer_locked(v: usize) -> bool {
    v & WRITER != 0
}

pub(crate) const fn is_reader_locked(v: usize) -> bool {
    v & READER != 0
}

pub(crate) const fn has_waiters(v: usize) -> bool {
    v & WAIT != 0
}

/// The reader count stored in the word itself. Only meaningful when `WAIT` is clear.
pub(crate) const fn reader_count(v: usize) -> usize {
    (v & HIGH) / ONE
}

/// Whether the word (held by readers) shows exactly one reader.
pub(crate) const fn exactly_one_reader(v: usize) -> bool {
    v & (HIGH ^ ONE) == 0
}

/// The queue head stored in `v`, if `WAIT` is set.
pub(crate) fn queue_head<Platform: ThreadProvider>(
    v: usize,
) -> Option<&'static ThreadSlot<Platform>> {
    if !has_waiters(v) {
        return None;
    }
    let ptr = core::ptr::with_exposed_provenance::<ThreadSlot<Platform>>(v & HIGH);
    // SAFETY: the high bits of a word with `WAIT` set only ever hold the address of a slot
    // published by `with_queue_head`. Slots are leaked by the thread registry and never freed.
    unsafe { ptr.as_ref() }
}

/// Place `head` into the high bits of `low`, which must carry only status bits.
pub(crate) fn with_queue_head<Platform: ThreadProvider>(
    low: usize,
    head: &ThreadSlot<Platform>,
) -> usize {
    let addr = core::ptr::from_ref(head).expose_provenance();
    debug_assert_eq!(addr & LOW, 0, "misaligned waiter slot");
    debug_assert_eq!(low & HIGH, 0);
    low | addr
}

/// Outcome of [`check_for_corruption`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Corruption {
    ReaderAndWriter,
    WriterWaitWithoutWait,
}

/// Cheap consistency check performed on every slow-path entry.
pub(crate) fn check_for_corruption(v: usize) -> Result<(), Corruption> {
    // Branch-free pre-check; both conditions are rare.
    let suspicious = (v & (WRITER | READER)) == (WRITER | READER)
        || (v & (WAIT | WRWAIT)) == WRWAIT;
    if !suspicious {
        return Ok(());
    }
    if v & (WRITER | READER) == WRITER | READER {
        Err(Corruption::ReaderAndWriter)
    } else {
        Err(Corruption::WriterWaitWithoutWait)
    }
}
