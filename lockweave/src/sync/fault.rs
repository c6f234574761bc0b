// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fatal usage errors and internal-corruption faults.

use thiserror::Error;

use super::events::EventSlot;
use super::{CONFIG_STACK_DEPTH, RawSyncPrimitivesProvider};

/// Programmer errors and corruption detected by the mutex engine.
///
/// None of these are recoverable: they are reported through the platform debug log (with the
/// object address, its debug name, and a stack) and then the calling thread panics. Builds with
/// `panic = "abort"` therefore abort the process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncFault {
    #[error("Mutex not write-held")]
    NotHeld,
    #[error("Mutex not read-held")]
    NotReaderHeld,
    #[error("Mutex not locked")]
    NotLocked,
    #[error("Mutex destroyed while held")]
    HeldAtDestruction,
    #[error("Mutex corrupted during {op}: both reader and writer lock held: {word:#x}")]
    ReaderAndWriter { op: &'static str, word: usize },
    #[error("Mutex corrupted during {op}: writer waiting with no waiter queue: {word:#x}")]
    WriterWaitWithoutWait { op: &'static str, word: usize },
    #[error("detected illegal recursion into Mutex code")]
    IllegalRecursion,
    #[error("thread releasing lock it does not hold")]
    ReleasingUnheld,
    #[error("thread acquiring a Mutex it already holds")]
    RecursiveLock,
    #[error("Mutex operation inside Condition")]
    ConditionReentry,
    #[error("dying due to potential deadlock")]
    PotentialDeadlock,
    #[error("Mutex held by this thread when assumed not held")]
    HeldWhenNotExpected,
    #[error("condition untrue on return from Await")]
    ConditionUntrue,
}

/// Log `fault` against the object at `addr` (named by `events`, if it has a name), and die.
#[cold]
#[track_caller]
pub(crate) fn fatal<Platform: RawSyncPrimitivesProvider>(
    platform: &Platform,
    fault: SyncFault,
    addr: usize,
    events: &EventSlot,
) -> ! {
    events.name(|name| report(platform, &fault, addr, name));
    panic!("{fault}")
}

/// Log `fault` against the object at `addr`, and carry on.
#[cold]
pub(crate) fn report<Platform: RawSyncPrimitivesProvider>(
    platform: &Platform,
    fault: &SyncFault,
    addr: usize,
    name: &str,
) {
    let stack = platform.capture_stack(CONFIG_STACK_DEPTH);
    debug_log_println!(platform, "{fault}: {addr:#x} {name} @ {stack}");
}
