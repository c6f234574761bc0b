//! A [lockweave platform](../lockweave/platform/index.html) for running lockweave on userland Linux.

// Restrict this crate to only work on Linux, where futexes are available.
#![cfg(target_os = "linux")]

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

use lockweave::platform::{ImmediatelyWokenUp, UnblockedOrTimedOut};
use lockweave::sync::{SlotLease, ThreadRegistry, ThreadSlot};
use thiserror::Error;

/// The userland Linux platform.
///
/// This implements the main [`lockweave::platform::Provider`] trait, i.e., implements all platform
/// traits.
pub struct LinuxUserland {
    /// File descriptor that debug output is written to.
    debug_log_fd: libc::c_int,
}

static PLATFORM: LinuxUserland = LinuxUserland {
    debug_log_fd: libc::STDERR_FILENO,
};

impl LinuxUserland {
    /// Get the userland-Linux platform for use with lockweave.
    ///
    /// The platform is stateless apart from its debug output (which goes to stderr), so every call
    /// returns the same process-wide instance.
    pub fn new() -> &'static Self {
        &PLATFORM
    }
}

impl lockweave::platform::Provider for LinuxUserland {}

impl lockweave::platform::RawMutexProvider for LinuxUserland {
    type RawMutex = RawMutex;
}

/// A futex-backed raw mutex.
///
/// Blocking waits directly on the underlying atomic, so a wake-up may be spurious (or stolen by a
/// concurrent waker); callers re-check the value, as the [`lockweave::platform::RawMutex`]
/// contract requires.
pub struct RawMutex {
    inner: AtomicU32,
}

impl RawMutex {
    fn block_or_maybe_timeout(
        &self,
        val: u32,
        timeout: Option<Duration>,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        // We immediately wake up (without even hitting syscalls) if we can clearly see that the
        // value is different.
        if self.inner.load(SeqCst) != val {
            return Err(ImmediatelyWokenUp);
        }

        let start = std::time::Instant::now();
        loop {
            let remaining_time = match timeout {
                None => None,
                Some(timeout) => match timeout.checked_sub(start.elapsed()) {
                    None => break Ok(UnblockedOrTimedOut::TimedOut),
                    Some(remaining_time) => Some(remaining_time),
                },
            };
            match futex_wait(&self.inner, val, remaining_time) {
                Ok(()) => break Ok(UnblockedOrTimedOut::Unblocked),
                Err(FutexError::ValueMismatch) => break Err(ImmediatelyWokenUp),
                Err(FutexError::TimedOut) => break Ok(UnblockedOrTimedOut::TimedOut),
                // Signals do not count as wake-ups; go back to sleep for whatever time remains.
                Err(FutexError::Interrupted) => {}
                Err(e @ FutexError::Unexpected(_)) => panic!("{e}"),
            }
        }
    }
}

impl lockweave::platform::RawMutex for RawMutex {
    const INIT: Self = Self {
        inner: AtomicU32::new(0),
    };

    fn underlying_atomic(&self) -> &AtomicU32 {
        &self.inner
    }

    fn wake_many(&self, n: usize) -> usize {
        assert!(n > 0);
        let n = u32::try_from(n).unwrap_or(u32::MAX).min(i32::MAX as u32);
        match futex_wake(&self.inner, n) {
            Ok(woken) => woken,
            Err(e) => panic!("{e}"),
        }
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
        timeout: Duration,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        self.block_or_maybe_timeout(val, Some(timeout))
    }
}

impl lockweave::platform::TimeProvider for LinuxUserland {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant {
            inner: std::time::Instant::now(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Instant {
    inner: std::time::Instant,
}

impl lockweave::platform::Instant for Instant {
    fn checked_duration_since(&self, earlier: &Self) -> Option<core::time::Duration> {
        self.inner.checked_duration_since(earlier.inner)
    }

    fn checked_add(&self, duration: core::time::Duration) -> Option<Self> {
        self.inner
            .checked_add(duration)
            .map(|inner| Instant { inner })
    }
}

impl lockweave::platform::DebugLogProvider for LinuxUserland {
    fn debug_log_print(&self, msg: &str) {
        let mut buf = msg.as_bytes();
        while !buf.is_empty() {
            match unsafe {
                syscalls::syscall3(
                    syscalls::Sysno::write,
                    usize::try_from(self.debug_log_fd).unwrap(),
                    buf.as_ptr() as usize,
                    buf.len(),
                )
            } {
                Ok(0) => break,
                Ok(n) => buf = &buf[n..],
                Err(syscalls::Errno::EINTR) => {}
                // Nowhere left to report this.
                Err(_) => break,
            }
        }
    }
}

/// A captured stack, symbolized when displayed.
pub struct StackTrace {
    backtrace: std::backtrace::Backtrace,
    max_depth: usize,
}

impl core::fmt::Display for StackTrace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let rendered = self.backtrace.to_string();
        for line in rendered.lines() {
            // Frames start with their index, e.g. `  12: some::function`; the `at file:line` lines
            // belong to the frame above them.
            let frame = line
                .trim_start()
                .split_once(':')
                .and_then(|(idx, _)| idx.parse::<usize>().ok());
            if frame.is_some_and(|idx| idx >= self.max_depth) {
                writeln!(f, "      ...")?;
                break;
            }
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl lockweave::platform::StackTraceProvider for LinuxUserland {
    type StackTrace = StackTrace;

    fn capture_stack(&self, max_depth: usize) -> Self::StackTrace {
        StackTrace {
            backtrace: std::backtrace::Backtrace::force_capture(),
            max_depth,
        }
    }
}

impl lockweave::platform::SchedulerProvider for LinuxUserland {
    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn available_parallelism(&self) -> usize {
        std::thread::available_parallelism().map_or(1, core::num::NonZeroUsize::get)
    }

    fn current_priority(&self) -> i32 {
        let mut policy: libc::c_int = 0;
        let mut param = libc::sched_param { sched_priority: 0 };
        // SAFETY: both out-pointers are valid for writes, and `pthread_self` is always a live
        // thread.
        let rc = unsafe { libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) };
        if rc == 0 { param.sched_priority } else { 0 }
    }
}

static REGISTRY: ThreadRegistry<LinuxUserland> = ThreadRegistry::new();

std::thread_local! {
    static SLOT: SlotLease<LinuxUserland> = SlotLease::new(&REGISTRY);
}

impl lockweave::platform::ThreadProvider for LinuxUserland {
    fn current_thread(&self) -> &ThreadSlot<Self> {
        SLOT.with(SlotLease::slot)
    }
}

/// Failures of the futex syscall, as seen by [`RawMutex`].
#[derive(Debug, Error)]
enum FutexError {
    #[error("futex value did not match")]
    ValueMismatch,
    #[error("futex wait timed out")]
    TimedOut,
    #[error("futex wait interrupted by a signal")]
    Interrupted,
    #[error("unexpected futex errno={0}")]
    Unexpected(syscalls::Errno),
}

impl From<syscalls::Errno> for FutexError {
    fn from(errno: syscalls::Errno) -> Self {
        match errno {
            syscalls::Errno::EAGAIN => FutexError::ValueMismatch,
            syscalls::Errno::ETIMEDOUT => FutexError::TimedOut,
            syscalls::Errno::EINTR => FutexError::Interrupted,
            errno => FutexError::Unexpected(errno),
        }
    }
}

/// `FUTEX_WAIT` on `uaddr` while it holds `val`, for at most `timeout`.
fn futex_wait(uaddr: &AtomicU32, val: u32, timeout: Option<Duration>) -> Result<(), FutexError> {
    let timeout = timeout.map(|t| libc::timespec {
        tv_sec: libc::time_t::try_from(t.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::from(i32::try_from(t.subsec_nanos()).unwrap_or(999_999_999)),
    });
    unsafe {
        syscalls::syscall6(
            syscalls::Sysno::futex,
            core::ptr::from_ref(uaddr) as usize,
            usize::try_from(libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG).unwrap(),
            val as usize,
            timeout.as_ref().map_or(0, |t| core::ptr::from_ref(t) as usize),
            0,
            0,
        )
    }?;
    Ok(())
}

/// `FUTEX_WAKE` up to `n` waiters on `uaddr`, returning how many were woken.
fn futex_wake(uaddr: &AtomicU32, n: u32) -> Result<usize, FutexError> {
    let woken = unsafe {
        syscalls::syscall6(
            syscalls::Sysno::futex,
            core::ptr::from_ref(uaddr) as usize,
            usize::try_from(libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG).unwrap(),
            n as usize,
            0,
            0,
            0,
        )
    }?;
    Ok(woken)
}
