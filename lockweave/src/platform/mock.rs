// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Crate-local test-only mock platform for easily running tests in the various modules.

// Pull in `std` for the test-only world, so that we have a nicer/easier time writing tests
extern crate std;

use core::sync::atomic::{AtomicU32, Ordering};
use std::string::String;
use std::sync::Mutex;

use super::*;
use crate::sync::{SlotLease, ThreadRegistry};

/// A mock platform that is a [`platform::Provider`](Provider), useful purely for testing within
/// this crate.
///
/// - Time is the host's monotonic clock
/// - Debugging output goes to stderr, and is also kept around for inspection (see
///   [`Self::take_log`])
/// - Blocking is a polite spin on the underlying atomic, so wakeups can never be lost (at the cost
///   of some CPU)
pub(crate) struct MockPlatform {
    log: Mutex<String>,
}

impl MockPlatform {
    pub(crate) fn new() -> &'static Self {
        //  Since this is used entirely for tests, leaking a bit of memory is perfectly fine in
        //  order to give ourselves a statically lived platform easily.
        alloc::boxed::Box::leak(alloc::boxed::Box::new(MockPlatform {
            log: Mutex::new(String::new()),
        }))
    }

    /// Everything logged through this platform since the last call.
    pub(crate) fn take_log(&self) -> String {
        core::mem::take(&mut *self.log.lock().unwrap())
    }
}

impl Provider for MockPlatform {}

pub(crate) struct MockRawMutex {
    inner: AtomicU32,
}

impl MockRawMutex {
    const fn new() -> Self {
        Self {
            inner: AtomicU32::new(0),
        }
    }

    fn block_or_maybe_timeout(
        &self,
        val: u32,
        timeout: Option<core::time::Duration>,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        if self.inner.load(Ordering::SeqCst) != val {
            return Err(ImmediatelyWokenUp);
        }
        let start = std::time::Instant::now();
        loop {
            if self.inner.load(Ordering::SeqCst) != val {
                return Ok(UnblockedOrTimedOut::Unblocked);
            }
            if timeout.is_some_and(|t| start.elapsed() >= t) {
                return Ok(UnblockedOrTimedOut::TimedOut);
            }
            std::thread::yield_now();
        }
    }
}

impl RawMutex for MockRawMutex {
    const INIT: Self = Self::new();

    fn underlying_atomic(&self) -> &AtomicU32 {
        &self.inner
    }

    fn wake_many(&self, _n: usize) -> usize {
        // Blocked threads poll the value, so there is nobody to notify.
        0
    }

    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp> {
        match self.block_or_maybe_timeout(val, None) {
            Ok(UnblockedOrTimedOut::Unblocked) => Ok(()),
            Ok(UnblockedOrTimedOut::TimedOut) => unreachable!(),
            Err(ImmediatelyWokenUp) => Err(ImmediatelyWokenUp),
        }
    }

    fn block_or_timeout(
        &self,
        val: u32,
        timeout: core::time::Duration,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        self.block_or_maybe_timeout(val, Some(timeout))
    }
}

impl RawMutexProvider for MockPlatform {
    type RawMutex = MockRawMutex;
}

impl TimeProvider for MockPlatform {
    type Instant = MockInstant;

    fn now(&self) -> Self::Instant {
        MockInstant(std::time::Instant::now())
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct MockInstant(std::time::Instant);

impl Instant for MockInstant {
    fn checked_duration_since(&self, earlier: &Self) -> Option<core::time::Duration> {
        self.0.checked_duration_since(earlier.0)
    }

    fn checked_add(&self, duration: core::time::Duration) -> Option<Self> {
        self.0.checked_add(duration).map(MockInstant)
    }
}

impl DebugLogProvider for MockPlatform {
    fn debug_log_print(&self, msg: &str) {
        std::eprint!("{msg}");
        self.log.lock().unwrap().push_str(msg);
    }
}

/// Stand-in for a captured stack: only remembers how deep it was asked to go.
pub(crate) struct MockStackTrace(usize);

impl core::fmt::Display for MockStackTrace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "<mock stack, {} frames>", self.0)
    }
}

impl StackTraceProvider for MockPlatform {
    type StackTrace = MockStackTrace;

    fn capture_stack(&self, max_depth: usize) -> Self::StackTrace {
        MockStackTrace(max_depth)
    }
}

impl SchedulerProvider for MockPlatform {
    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn sleep(&self, duration: core::time::Duration) {
        std::thread::sleep(duration);
    }

    fn available_parallelism(&self) -> usize {
        std::thread::available_parallelism().map_or(1, core::num::NonZeroUsize::get)
    }
}

static REGISTRY: ThreadRegistry<MockPlatform> = ThreadRegistry::new();

std::thread_local! {
    static SLOT: SlotLease<MockPlatform> = SlotLease::new(&REGISTRY);
}

impl ThreadProvider for MockPlatform {
    fn current_thread(&self) -> &ThreadSlot<Self> {
        SLOT.with(SlotLease::slot)
    }
}
