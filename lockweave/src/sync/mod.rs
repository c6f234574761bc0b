// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Synchronization primitives: an adaptive [`Mutex`] with exclusive and shared modes, a
//! [`CondVar`], and an integrated deadlock-cycle detector.
//!
//! All state of a mutex lives in a single atomically updated lock word (see `word`), plus an
//! intrusive queue of per-thread [`ThreadSlot`]s. Uncontended operations are a single
//! compare-and-swap; contended ones take an internal spin bit in the lock word, queue the calling
//! thread, and park it through the [`platform`].
//!
//! A releaser that wakes waiters leaves a "designated waker" mark behind, so that concurrent
//! releasers need not wake anyone else. Condition-variable waiters are transferred directly onto
//! the mutex queue when signalled, so that they wake up exactly once, already positioned to take
//! the mutex.

use crate::platform;

/// Generate a debug-log line via the platform, without allocating.
macro_rules! debug_log_println {
    ($platform:expr, $($tt:tt)*) => {{
        use core::fmt::Write as _;
        let mut w = $crate::sync::log::DebugLogWriter::new($platform);
        let _ = writeln!(w, $($tt)*);
    }}
}

mod backoff;
mod condition;
mod condvar;
pub(crate) mod deadlock;
mod events;
mod fault;
mod guard;
pub(crate) mod log;
mod mutex;
mod queue;
mod slow_path;
mod thread_slot;
mod word;


pub use backoff::set_mutex_sleep_time;
pub use condition::Condition;
pub use condvar::CondVar;
pub use deadlock::{
    OnDeadlockCycle, deadlock_detection_mode, reported_cycles, set_deadlock_detection_mode,
};
pub use events::enable_invariant_checking;
pub use fault::SyncFault;
pub use guard::{MutexGuard, ReaderMutexGuard};
pub use mutex::Mutex;
pub use thread_slot::{SlotLease, ThreadRegistry, ThreadSlot};

/// A convenience name for specific requirements from the platform
pub trait RawSyncPrimitivesProvider: platform::Provider + Sync + 'static {}
impl<Platform> RawSyncPrimitivesProvider for Platform where Platform: platform::Provider + Sync + 'static
{}

/// Maximum number of distinct locks tracked per thread for deadlock detection; further locks are
/// not tracked.
const CONFIG_MAX_HELD_LOCKS: usize = 40;

/// Maximum number of mutexes printed for a single deadlock cycle.
const CONFIG_MAX_CYCLE_PATH: usize = 10;

/// Number of deadlock reports (per process) that include symbolized stacks.
const CONFIG_SYMBOLIZED_REPORTS: usize = 2;

/// Number of frames captured for any diagnostic stack.
const CONFIG_STACK_DEPTH: usize = 40;

/// Size of the formatting buffer used for a debug-log line.
const CONFIG_LOG_BUFFER: usize = 1024;

/// How often a waiting thread re-reads its scheduling priority.
const CONFIG_PRIORITY_REFRESH: core::time::Duration = core::time::Duration::from_secs(1);
