// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The [`Mutex`] façade: fast paths, conditional acquisition, assertions, and debugging hooks.
//! Everything that may block lives in `slow_path`.

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use super::backoff::spinloop_iterations;
use super::condition::Condition;
use super::deadlock::{self, GraphId};
use super::events::{
    EventSlot, SyncEventKind, invariant_checking_enabled, post_sync_event, set_bits_when_clear,
};
use super::fault::{self, SyncFault};
use super::guard::{MutexGuard, ReaderMutexGuard};
use super::queue::EnqueueFlags;
use super::word::{
    self, Corruption, EVENT, LockMode, ONE, READER, SPIN, WAIT, WRITER, WRWAIT, DESIG,
};
use super::RawSyncPrimitivesProvider;
use crate::platform::Instant as _;

/// A mutual-exclusion lock with exclusive (writer) and shared (reader) modes.
///
/// Unlike [`std::sync::Mutex`], this mutex does not own the data it protects: it is locked and
/// unlocked explicitly (or through [`Mutex::guard`]), which allows conditional critical sections
/// such as [`Mutex::lock_when`] and [`Mutex::await_condition`], and hand-over to a [`CondVar`].
///
/// An uncontended lock or unlock is a single compare-and-swap. Under contention, a writer first
/// spins briefly (on multi-core machines), then queues itself and parks.
///
/// [`std::sync::Mutex`]: https://doc.rust-lang.org/std/sync/struct.Mutex.html
/// [`CondVar`]: super::CondVar
pub struct Mutex<Platform: 'static> {
    pub(crate) platform: &'static Platform,
    /// The lock word; see `word` for its layout.
    pub(crate) word: AtomicUsize,
    /// Raw [`GraphId`] of this mutex in the lock ordering graph, or zero if it has none yet.
    graph_id: AtomicU64,
    events: EventSlot,
}

impl<Platform: RawSyncPrimitivesProvider> Mutex<Platform> {
    /// Returns a new, unlocked mutex.
    pub const fn new(platform: &'static Platform) -> Self {
        Self {
            platform,
            word: AtomicUsize::new(0),
            graph_id: AtomicU64::new(0),
            events: EventSlot::new(),
        }
    }

    fn addr(&self) -> usize {
        ptr::from_ref(self).addr()
    }

    /// Report `fault` against this mutex, and die.
    #[cold]
    #[track_caller]
    pub(crate) fn fatal(&self, fault: SyncFault) -> ! {
        fault::fatal(self.platform, fault, self.addr(), &self.events)
    }

    pub(crate) fn check_for_corruption(&self, v: usize, op: &'static str) {
        match word::check_for_corruption(v) {
            Ok(()) => {}
            Err(Corruption::ReaderAndWriter) => {
                self.fatal(SyncFault::ReaderAndWriter { op, word: v })
            }
            Err(Corruption::WriterWaitWithoutWait) => {
                self.fatal(SyncFault::WriterWaitWithoutWait { op, word: v })
            }
        }
    }

    pub(crate) fn post_event(&self, kind: SyncEventKind) {
        post_sync_event(self.platform, &self.events, self.addr(), kind);
    }

    fn deadlock_check(&self) -> GraphId {
        deadlock::deadlock_check(self.platform, &self.graph_id, self.addr())
            .unwrap_or_else(|fault| self.fatal(fault))
    }

    fn lock_enter(&self, id: GraphId) {
        deadlock::lock_enter(self.platform, &self.graph_id, self.addr(), id);
    }

    fn lock_leave(&self) {
        if let Err(fault) = deadlock::lock_leave(self.platform, &self.graph_id, self.addr()) {
            self.fatal(fault);
        }
    }

    /// The slow paths always check this; the fast paths only in debug builds.
    fn debug_check_not_in_condition(&self) {
        if cfg!(debug_assertions) {
            self.check_not_in_condition();
        }
    }

    fn deadline_after(&self, timeout: Duration) -> Option<Platform::Instant> {
        self.platform.now().checked_add(timeout)
    }

    /// Block until this mutex is free, then take it exclusively.
    pub fn lock(&self) {
        self.debug_check_not_in_condition();
        let id = self.deadlock_check();
        let v = self.word.load(Ordering::Relaxed);
        if (v & (WRITER | READER | EVENT) != 0
            || self
                .word
                .compare_exchange(v, WRITER | v, Ordering::Acquire, Ordering::Relaxed)
                .is_err())
            && !self.try_acquire_with_spinning()
        {
            self.lock_slow(LockMode::Exclusive, None, EnqueueFlags::empty());
        }
        self.lock_enter(id);
    }

    /// Spin for a while on the lock word, as long as only a writer holds it.
    fn try_acquire_with_spinning(&self) -> bool {
        let mut c = spinloop_iterations(self.platform);
        loop {
            let v = self.word.load(Ordering::Relaxed);
            if v & (READER | EVENT) != 0 {
                // Readers may hold on for long; with events, everything goes the slow way.
                return false;
            }
            if v & WRITER == 0
                && self
                    .word
                    .compare_exchange(v, WRITER | v, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }
            if c <= 1 {
                return false;
            }
            c -= 1;
            core::hint::spin_loop();
        }
    }

    /// Take this mutex exclusively if that is possible without blocking.
    pub fn try_lock(&self) -> bool {
        self.debug_check_not_in_condition();
        let v = self.word.load(Ordering::Relaxed);
        if v & (WRITER | READER | EVENT) == 0 {
            if self
                .word
                .compare_exchange(v, WRITER | v, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.lock_enter(GraphId::INVALID);
                return true;
            }
        } else if v & EVENT != 0 {
            return self.try_lock_slow();
        }
        false
    }

    fn try_lock_slow(&self) -> bool {
        let v = self.word.load(Ordering::Relaxed);
        let t = LockMode::Exclusive.table();
        if v & t.slow_need_zero == 0
            && self
                .word
                .compare_exchange(
                    v,
                    (t.fast_or | v) + t.fast_add,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            self.lock_enter(GraphId::INVALID);
            self.post_event(SyncEventKind::TryLockSuccess);
            return true;
        }
        self.post_event(SyncEventKind::TryLockFailed);
        false
    }

    /// Release this mutex, which the calling thread must hold exclusively.
    pub fn unlock(&self) {
        self.debug_check_not_in_condition();
        self.lock_leave();
        let v = self.word.load(Ordering::Relaxed);
        if v & (WRITER | READER) != WRITER {
            self.fatal(SyncFault::NotHeld);
        }
        // Fast release, unless there are waiters to wake and nobody designated to wake them.
        let should_try_cas = v & (EVENT | WRITER) == WRITER && v & (WAIT | DESIG) != WAIT;
        if !(should_try_cas
            && self
                .word
                .compare_exchange(
                    v,
                    v & !(WRWAIT | WRITER),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok())
        {
            self.unlock_slow(None);
        }
    }

    /// Block until no writer holds (or waits for) this mutex, then take it shared.
    pub fn reader_lock(&self) {
        self.debug_check_not_in_condition();
        let id = self.deadlock_check();
        let mut v = self.word.load(Ordering::Relaxed);
        loop {
            if v & (WRITER | WAIT | EVENT) != 0 {
                self.lock_slow(LockMode::Shared, None, EnqueueFlags::empty());
                break;
            }
            match self.word.compare_exchange_weak(
                v,
                (READER | v) + ONE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => v = actual,
            }
        }
        self.lock_enter(id);
    }

    /// Take this mutex shared if that is possible without blocking.
    pub fn reader_try_lock(&self) -> bool {
        self.debug_check_not_in_condition();
        let mut v = self.word.load(Ordering::Relaxed);
        for _ in 0..5 {
            if v & (WRITER | WAIT | EVENT) != 0 {
                break;
            }
            match self.word.compare_exchange(
                v,
                (READER | v) + ONE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.lock_enter(GraphId::INVALID);
                    return true;
                }
                Err(actual) => v = actual,
            }
        }
        if v & EVENT == 0 {
            return false;
        }
        self.reader_try_lock_slow()
    }

    fn reader_try_lock_slow(&self) -> bool {
        let mut v = self.word.load(Ordering::Relaxed);
        let mut attempts = 5;
        while v & (WRITER | WAIT) == 0 && attempts != 0 {
            if self
                .word
                .compare_exchange(
                    v,
                    (READER | v) + ONE,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.lock_enter(GraphId::INVALID);
                self.post_event(SyncEventKind::ReaderTryLockSuccess);
                return true;
            }
            attempts -= 1;
            v = self.word.load(Ordering::Relaxed);
        }
        if v & EVENT != 0 {
            self.post_event(SyncEventKind::ReaderTryLockFailed);
        }
        false
    }

    /// Release one shared hold of this mutex by the calling thread.
    pub fn reader_unlock(&self) {
        self.debug_check_not_in_condition();
        self.lock_leave();
        let mut v = self.word.load(Ordering::Relaxed);
        if v & (WRITER | READER) != READER {
            self.fatal(SyncFault::NotReaderHeld);
        }
        loop {
            if v & (READER | WAIT | EVENT) != READER {
                self.unlock_slow(None);
                return;
            }
            let clear = if word::exactly_one_reader(v) {
                READER | ONE
            } else {
                ONE
            };
            match self.word.compare_exchange(
                v,
                v - clear,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => v = actual,
            }
        }
    }

    fn lock_when_common(
        &self,
        how: LockMode,
        cond: &Condition<'_>,
        deadline: Option<Platform::Instant>,
    ) -> bool {
        let id = self.deadlock_check();
        let res = self.lock_slow_with_deadline(how, Some(cond), deadline, EnqueueFlags::empty());
        self.lock_enter(id);
        res
    }

    /// Block until `cond` holds and this mutex is free, then take it exclusively.
    pub fn lock_when(&self, cond: &Condition<'_>) {
        if !self.lock_when_common(LockMode::Exclusive, cond, None) {
            self.fatal(SyncFault::ConditionUntrue);
        }
    }

    /// Like [`Self::lock_when`], but stop waiting for `cond` after `timeout`.
    ///
    /// Returns with the mutex held either way; the result is whether `cond` holds.
    pub fn lock_when_with_timeout(&self, cond: &Condition<'_>, timeout: Duration) -> bool {
        self.lock_when_common(LockMode::Exclusive, cond, self.deadline_after(timeout))
    }

    /// Like [`Self::lock_when`], but stop waiting for `cond` at `deadline`.
    ///
    /// Returns with the mutex held either way; the result is whether `cond` holds.
    pub fn lock_when_with_deadline(
        &self,
        cond: &Condition<'_>,
        deadline: Platform::Instant,
    ) -> bool {
        self.lock_when_common(LockMode::Exclusive, cond, Some(deadline))
    }

    /// Block until `cond` holds and no writer holds this mutex, then take it shared.
    pub fn reader_lock_when(&self, cond: &Condition<'_>) {
        if !self.lock_when_common(LockMode::Shared, cond, None) {
            self.fatal(SyncFault::ConditionUntrue);
        }
    }

    /// Shared counterpart of [`Self::lock_when_with_timeout`].
    pub fn reader_lock_when_with_timeout(&self, cond: &Condition<'_>, timeout: Duration) -> bool {
        self.lock_when_common(LockMode::Shared, cond, self.deadline_after(timeout))
    }

    /// Shared counterpart of [`Self::lock_when_with_deadline`].
    pub fn reader_lock_when_with_deadline(
        &self,
        cond: &Condition<'_>,
        deadline: Platform::Instant,
    ) -> bool {
        self.lock_when_common(LockMode::Shared, cond, Some(deadline))
    }

    /// Release this mutex until `cond` holds, then reacquire it in the mode it was held in.
    ///
    /// The calling thread must hold the mutex. Unlike a condition variable, no signalling is
    /// needed: releasers of the mutex evaluate `cond` on the waiter's behalf.
    pub fn await_condition(&self, cond: &Condition<'_>) {
        self.await_common(cond, None);
    }

    /// Like [`Self::await_condition`], but stop waiting for `cond` after `timeout`.
    ///
    /// Returns with the mutex held either way; the result is whether `cond` holds.
    pub fn await_condition_with_timeout(&self, cond: &Condition<'_>, timeout: Duration) -> bool {
        self.await_common(cond, self.deadline_after(timeout))
    }

    /// Like [`Self::await_condition`], but stop waiting for `cond` at `deadline`.
    ///
    /// Returns with the mutex held either way; the result is whether `cond` holds.
    pub fn await_condition_with_deadline(
        &self,
        cond: &Condition<'_>,
        deadline: Platform::Instant,
    ) -> bool {
        self.await_common(cond, Some(deadline))
    }

    /// Die unless this mutex is held exclusively (by any thread).
    pub fn assert_held(&self) {
        if !word::is_writer_locked(self.word.load(Ordering::Relaxed)) {
            self.fatal(SyncFault::NotHeld);
        }
    }

    /// Die unless this mutex is held, in either mode (by any thread).
    pub fn assert_reader_held(&self) {
        let v = self.word.load(Ordering::Relaxed);
        if !word::is_reader_locked(v) && !word::is_writer_locked(v) {
            self.fatal(SyncFault::NotLocked);
        }
    }

    /// Die if the calling thread is known to hold this mutex.
    ///
    /// Ownership is only tracked while deadlock detection is on; otherwise this never fails.
    pub fn assert_not_held(&self) {
        if self.word.load(Ordering::Relaxed) & (WRITER | READER) != 0
            && deadlock::holds(self.platform, &self.graph_id)
        {
            self.fatal(SyncFault::HeldWhenNotExpected);
        }
    }

    /// Log every operation on this mutex, under `name`, through the platform debug log.
    pub fn enable_debug_log(&self, name: &str) {
        let event = self.events.ensure();
        event.set_name(name);
        event.set_log(true);
        set_bits_when_clear(&self.word, EVENT, SPIN);
    }

    /// Run `invariant` after every acquisition and before every release of this mutex.
    ///
    /// Has no effect unless invariant checking has been turned on (process-wide) with
    /// [`enable_invariant_checking`](super::enable_invariant_checking).
    pub fn enable_invariant_debugging(&self, invariant: impl Fn() + Send + Sync + 'static) {
        if !invariant_checking_enabled() {
            return;
        }
        self.events.ensure().set_invariant(Box::new(invariant));
        set_bits_when_clear(&self.word, EVENT, SPIN);
    }

    /// Lock exclusively, releasing when the returned guard goes out of scope.
    pub fn guard(&self) -> MutexGuard<'_, Platform> {
        self.lock();
        MutexGuard::new(self)
    }

    /// Lock shared, releasing when the returned guard goes out of scope.
    pub fn reader_guard(&self) -> ReaderMutexGuard<'_, Platform> {
        self.reader_lock();
        ReaderMutexGuard::new(self)
    }
}

impl<Platform: 'static> Drop for Mutex<Platform> {
    fn drop(&mut self) {
        debug_assert!(
            *self.word.get_mut() & (WRITER | READER) == 0,
            "{}",
            SyncFault::HeldAtDestruction
        );
        deadlock::forget(&mut self.graph_id);
    }
}

impl<Platform: 'static> core::fmt::Debug for Mutex<Platform> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let v = self.word.load(Ordering::Relaxed);
        let mut d = f.debug_struct("Mutex");
        d.field("word", &format_args!("{v:#x}"));
        if word::is_reader_locked(v) && !word::has_waiters(v) {
            d.field("readers", &word::reader_count(v));
        }
        d.finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::sync::atomic::AtomicBool;

    use super::*;
    use crate::platform::mock::MockPlatform;
    use crate::platform::TimeProvider as _;

    #[test]
    fn uncontended_lock_is_a_single_bit() {
        let platform = MockPlatform::new();
        let mu = Mutex::new(platform);
        mu.lock();
        assert_eq!(mu.word.load(Ordering::Relaxed), WRITER);
        mu.assert_held();
        assert!(!mu.try_lock());
        assert!(!mu.reader_try_lock());
        mu.unlock();
        assert_eq!(mu.word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn readers_are_counted_in_the_word() {
        let platform = MockPlatform::new();
        let mu = Mutex::new(platform);
        mu.reader_lock();
        // Another thread's shared hold, as far as the word is concerned.
        mu.word.fetch_add(ONE, Ordering::Relaxed);
        assert_eq!(mu.word.load(Ordering::Relaxed), READER | 2 * ONE);
        mu.assert_reader_held();
        assert!(std::format!("{mu:?}").contains("readers: 2"));
        assert!(!mu.try_lock());
        mu.word.fetch_sub(ONE, Ordering::Relaxed);
        mu.reader_unlock();
        assert_eq!(mu.word.load(Ordering::Relaxed), 0);
        assert!(mu.try_lock());
        mu.unlock();
    }

    #[test]
    fn satisfied_conditions_do_not_block() {
        let platform = MockPlatform::new();
        let mu = Mutex::new(platform);
        let ready = AtomicBool::new(true);
        let cond = Condition::from_flag(&ready);
        mu.lock_when(&cond);
        mu.await_condition(&cond);
        mu.unlock();
        mu.reader_lock_when(&cond);
        mu.await_condition(&cond);
        mu.reader_unlock();
    }

    #[test]
    fn conditional_locks_time_out_holding_the_lock() {
        let platform = MockPlatform::new();
        let mu = Mutex::new(platform);
        let ready = AtomicBool::new(false);
        let cond = Condition::from_flag(&ready);
        assert!(!mu.lock_when_with_timeout(&cond, Duration::from_millis(10)));
        mu.assert_held();
        assert!(!mu.await_condition_with_timeout(&cond, Duration::from_millis(10)));
        mu.assert_held();
        mu.unlock();
        let deadline = platform.now().checked_add(Duration::from_millis(5)).unwrap();
        assert!(!mu.reader_lock_when_with_deadline(&cond, deadline));
        mu.assert_reader_held();
        mu.reader_unlock();
        assert_eq!(mu.word.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "Mutex not write-held")]
    fn asserting_a_free_mutex_held_is_fatal() {
        let platform = MockPlatform::new();
        let mu = Mutex::new(platform);
        mu.assert_held();
    }

    #[test]
    #[should_panic(expected = "Mutex not read-held")]
    fn reader_unlocking_a_write_held_mutex_is_fatal() {
        let platform = MockPlatform::new();
        // Leaked: it is still held when the panic unwinds.
        let mu: &'static Mutex<MockPlatform> = Box::leak(Box::new(Mutex::new(platform)));
        mu.lock();
        mu.reader_unlock();
    }

    #[test]
    fn debug_logging_diverts_to_the_slow_paths() {
        let platform = MockPlatform::new();
        let mu = Mutex::new(platform);
        mu.enable_debug_log("accounts");
        assert_ne!(mu.word.load(Ordering::Relaxed) & EVENT, 0);
        mu.lock();
        assert!(!mu.try_lock());
        mu.unlock();
        assert!(mu.reader_try_lock());
        mu.reader_unlock();
        let log = platform.take_log();
        for expected in [
            "Lock blocking ",
            "Lock returning ",
            "TryLock failed ",
            "Unlock ",
            "ReaderTryLock succeeded ",
            "ReaderUnlock ",
            "accounts",
        ] {
            assert!(log.contains(expected), "{expected:?} missing from {log}");
        }
        assert_eq!(mu.word.load(Ordering::Relaxed), EVENT);
    }

    #[test]
    fn guards_release_on_drop() {
        let platform = MockPlatform::new();
        let mu = Mutex::new(platform);
        {
            let _g = mu.guard();
            assert!(!mu.try_lock());
        }
        {
            let _r1 = mu.reader_guard();
            assert!(!mu.try_lock());
        }
        assert!(mu.try_lock());
        mu.unlock();
    }
}
