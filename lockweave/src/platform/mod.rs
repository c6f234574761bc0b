//! The underlying platform upon which lockweave's primitives park threads, tell time, and report.
//!
//! The top-level trait that denotes something is a valid lockweave platform is [`Provider`]. This
//! trait is merely a collection of subtraits that could be composed independently from various
//! other crates that implement them upon various types.

#[cfg(test)]
pub(crate) mod mock;

use crate::sync::ThreadSlot;

/// A provider of a platform upon which lockweave can execute.
///
/// Ideally, a [`Provider`] is zero-sized, and only exists to provide access to functionality
/// provided by it. _However_, most of the provided APIs within the provider act upon an `&self` to
/// allow storage of any useful "globals" within it necessary.
pub trait Provider:
    RawMutexProvider
    + TimeProvider
    + DebugLogProvider
    + StackTraceProvider
    + SchedulerProvider
    + ThreadProvider
{
}

/// A provider of raw mutexes
pub trait RawMutexProvider {
    type RawMutex: RawMutex;
}

/// A raw mutex/lock API; expected to roughly match (or even be implemented using) a Linux futex.
///
/// Blocking may return spuriously; every user of a [`RawMutex`] re-checks its own state after
/// [`RawMutex::block`] returns.
pub trait RawMutex: Send + Sync + Sized {
    /// A raw mutex whose underlying value is zero, with no waiters.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self;

    /// Returns a reference to the underlying atomic value
    fn underlying_atomic(&self) -> &core::sync::atomic::AtomicU32;

    /// Wake up `n` threads blocked on on this raw mutex.
    ///
    /// Returns the number of waiters that were woken up.
    fn wake_many(&self, n: usize) -> usize;

    /// Wake up one thread blocked on this raw mutex.
    ///
    /// Returns true if this actually woke up such a thread, or false if no thread was waiting on this raw mutex.
    fn wake_one(&self) -> bool {
        self.wake_many(1) > 0
    }

    /// Wake up all threads that are blocked on this raw mutex.
    ///
    /// Returns the number of waiters that were woken up.
    fn wake_all(&self) -> usize {
        self.wake_many(usize::MAX)
    }

    /// If the underlying value is `val`, block until a wake operation wakes us up.
    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp>;

    /// If the underlying value is `val`, block until a wake operation wakes us up, or some `time`
    /// has passed without a wake operation having occured.
    fn block_or_timeout(
        &self,
        val: u32,
        time: core::time::Duration,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp>;
}

/// A zero-sized struct indicating that the block was immediately unblocked (due to non-matching
/// value).
pub struct ImmediatelyWokenUp;

/// Named-boolean to indicate whether [`RawMutex::block_or_timeout`] was woken up or timed out.
#[must_use]
pub enum UnblockedOrTimedOut {
    /// Unblocked by a wake call
    Unblocked,
    /// Sufficient time elapsed without a wake call
    TimedOut,
}

/// An interface to understanding time.
pub trait TimeProvider {
    type Instant: Instant;
    /// Returns an instant coresponding to "now".
    fn now(&self) -> Self::Instant;
}

/// An opaque measurement of a monotonically nondecreasing clock.
///
/// Deadlines handed to lockweave are expressed as instants of this clock.
pub trait Instant: Copy + Send + Sync + Sized {
    /// Returns the amount of time elapsed from another instant to this one, or `None` if that
    /// instant is later than this one.
    fn checked_duration_since(&self, earlier: &Self) -> Option<core::time::Duration>;
    /// Returns the amount of time elapsed from another instant to this one, or zero duration if
    /// that instant is later than this one.
    fn duration_since(&self, earlier: &Self) -> core::time::Duration {
        self.checked_duration_since(earlier)
            .unwrap_or(core::time::Duration::from_secs(0))
    }
    /// Returns the instant `duration` after this one, or `None` if it cannot be represented.
    fn checked_add(&self, duration: core::time::Duration) -> Option<Self>;
}

/// An interface to dumping debug output for tracing purposes.
pub trait DebugLogProvider {
    /// Print `msg` to the debug log
    ///
    /// Newlines are *not* automatically appended to `msg`, thus the caller must make sure to
    /// include newlines if necessary.
    ///
    /// One some platforms, this might be a slow/expensive operation, thus ideally callers of this
    /// should prefer not making a large number of small prints to print a single logical message,
    /// but instead should combine all strings part of a single logical message into a single
    /// `debug_log_print` call.
    fn debug_log_print(&self, msg: &str);
}

/// Stack capture for diagnostics (deadlock reports, event logs, fatal errors).
pub trait StackTraceProvider {
    /// A captured stack. Displaying it symbolizes the captured frames, which may be expensive.
    type StackTrace: core::fmt::Display + Send + Sync + 'static;

    /// Capture the calling thread's stack, keeping at most `max_depth` frames.
    fn capture_stack(&self, max_depth: usize) -> Self::StackTrace;
}

/// Hooks into the host scheduler, used for bounded back-off and priority-aware queueing.
pub trait SchedulerProvider {
    /// Give up the rest of the current time slice.
    fn yield_now(&self);

    /// Sleep for (at least) `duration`.
    fn sleep(&self, duration: core::time::Duration);

    /// The number of CPUs that can run threads of this process concurrently.
    fn available_parallelism(&self) -> usize;

    /// Scheduling priority of the calling thread; larger values are more urgent.
    fn current_priority(&self) -> i32 {
        0
    }
}

/// The thread identity registry.
///
/// Each calling thread is handed a stable [`ThreadSlot`] that lives for (at least) as long as the
/// thread does. Slots must never be freed, only recycled; [`crate::sync::ThreadRegistry`] is a
/// ready-made pool that platforms can wire into their thread-local storage.
pub trait ThreadProvider: RawMutexProvider + TimeProvider + Sized + 'static {
    /// The waiter slot of the calling thread.
    fn current_thread(&self) -> &ThreadSlot<Self>;
}
