// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A condition variable for use with [`Mutex`].

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use super::RawSyncPrimitivesProvider;
use super::backoff::{DelayMode, delay};
use super::events::{EventSlot, SyncEventKind, post_sync_event, set_bits_when_clear};
use super::fault::SyncFault;
use super::mutex::Mutex;
use super::queue::{EnqueueFlags, wakeup as wakeup_slot};
use super::thread_slot::{ThreadSlot, WaitParams};
use super::word::LockMode;
use crate::platform::{Instant as _, ThreadProvider};

/// Spinlock guarding the waiter list.
const CV_SPIN: usize = 0x0001;
/// Event recording is enabled for this condvar.
const CV_EVENT: usize = 0x0002;
const CV_LOW: usize = 0x0003;

/// A condition variable.
///
/// Waiters are kept on a circular list whose tail is stored in the high bits of a single word.
/// A signalled waiter is not simply woken: if the mutex it waited with is busy, it is moved onto
/// that mutex's queue instead, so that it wakes up exactly once, when it can take the mutex.
pub struct CondVar<Platform: 'static> {
    platform: &'static Platform,
    word: AtomicUsize,
    events: EventSlot,
}

/// The newest waiter on the list in `v`, if any.
fn tail<Platform: ThreadProvider>(v: usize) -> Option<&'static ThreadSlot<Platform>> {
    let p = ptr::with_exposed_provenance::<ThreadSlot<Platform>>(v & !CV_LOW);
    // SAFETY: the high bits of a condvar word are either zero or the address of a leaked slot
    // stored by `condvar_enqueue` or `CondVar::remove`.
    unsafe { p.as_ref() }
}

fn with_tail<Platform: ThreadProvider>(low: usize, tail: Option<&ThreadSlot<Platform>>) -> usize {
    low | tail.map_or(0, |t| ptr::from_ref(t).expose_provenance())
}

/// Queue the thread of `waitp` on the condvar whose word is `cv_word`.
///
/// Called by a mutex release that is part of a condvar wait, while the mutex is still held, so
/// that no signal can be missed.
pub(crate) fn condvar_enqueue<Platform: RawSyncPrimitivesProvider>(
    platform: &Platform,
    cv_word: &AtomicUsize,
    waitp: &WaitParams<Platform>,
) -> Result<(), SyncFault> {
    let mut v = cv_word.load(Ordering::Relaxed);
    let mut c = 0;
    while v & CV_SPIN != 0
        || cv_word
            .compare_exchange_weak(v, v | CV_SPIN, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
    {
        c = delay(platform, c, DelayMode::Gentle);
        v = cv_word.load(Ordering::Relaxed);
    }
    let s = waitp.thread;
    if let Err(fault) = s.begin_wait(waitp) {
        cv_word.store(v, Ordering::Release);
        return Err(fault);
    }
    match tail::<Platform>(v) {
        None => s.next.set(Some(s)),
        Some(h) => {
            s.next.set(h.next.get());
            h.next.set(Some(s));
        }
    }
    s.mark_queued();
    cv_word.store(with_tail(v & CV_EVENT, Some(s)), Ordering::Release);
    Ok(())
}

impl<Platform: RawSyncPrimitivesProvider> CondVar<Platform> {
    /// Returns a new condvar, with nobody waiting.
    pub const fn new(platform: &'static Platform) -> Self {
        Self {
            platform,
            word: AtomicUsize::new(0),
            events: EventSlot::new(),
        }
    }

    fn addr(&self) -> usize {
        ptr::from_ref(self).addr()
    }

    fn post_event(&self, kind: SyncEventKind) {
        post_sync_event(self.platform, &self.events, self.addr(), kind);
    }

    /// Atomically release `mu` and wait for a signal, then reacquire `mu` in the mode it was
    /// held in.
    ///
    /// Wakeups may be spurious: callers must re-check their predicate in a loop.
    pub fn wait(&self, mu: &Mutex<Platform>) {
        self.wait_common(mu, None);
    }

    /// Like [`Self::wait`], but give up waiting for a signal after `timeout`.
    ///
    /// Returns true if the wait timed out. `mu` is held again either way.
    pub fn wait_with_timeout(&self, mu: &Mutex<Platform>, timeout: Duration) -> bool {
        self.wait_common(mu, self.platform.now().checked_add(timeout))
    }

    /// Like [`Self::wait`], but give up waiting for a signal at `deadline`.
    ///
    /// Returns true if the wait timed out. `mu` is held again either way.
    pub fn wait_with_deadline(&self, mu: &Mutex<Platform>, deadline: Platform::Instant) -> bool {
        self.wait_common(mu, Some(deadline))
    }

    fn wait_common(&self, mu: &Mutex<Platform>, deadline: Option<Platform::Instant>) -> bool {
        let mut timed_out = false;
        let how = LockMode::held_in(mu.word.load(Ordering::Relaxed));
        let v = self.word.load(Ordering::Relaxed);
        if v & CV_EVENT != 0 {
            self.post_event(SyncEventKind::Wait);
        }

        // The release queues us on this condvar just before letting go of `mu`.
        let waitp = WaitParams::for_condvar(
            how,
            deadline,
            mu,
            &self.word,
            self.platform.current_thread(),
        );
        mu.unlock_slow(Some(&waitp));

        while waitp.thread.is_queued() {
            if !waitp.thread.park(self.platform, waitp.deadline()) {
                // Either we remove ourselves now, or a signaller already has us and is about to
                // hand us back.
                waitp.clear_deadline();
                self.remove(waitp.thread);
                timed_out = true;
            }
        }
        if let Err(fault) = waitp.thread.end_wait() {
            mu.fatal(fault);
        }
        if v & CV_EVENT != 0 {
            self.post_event(SyncEventKind::WaitReturning);
        }
        mu.lock_slow(how, None, EnqueueFlags::HAS_BLOCKED | EnqueueFlags::IS_COND);
        timed_out
    }

    /// Remove `s` from the waiter list, if it is still there.
    fn remove(&self, s: &'static ThreadSlot<Platform>) {
        let mut c = 0;
        loop {
            let v = self.word.load(Ordering::Relaxed);
            if v & CV_SPIN == 0
                && self
                    .word
                    .compare_exchange(v, v | CV_SPIN, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                let mut h = tail::<Platform>(v);
                if let Some(head) = h {
                    let mut w = head;
                    while !w.next.is(s) && !w.next.is(head) {
                        w = w.next.follow();
                    }
                    if w.next.is(s) {
                        w.next.set(s.next.get());
                        if ptr::eq(head, s) {
                            h = if ptr::eq(w, s) { None } else { Some(w) };
                        }
                        s.next.set(None);
                        s.mark_available();
                    }
                }
                self.word
                    .store(with_tail(v & CV_EVENT, h), Ordering::Release);
                return;
            }
            c = delay(self.platform, c, DelayMode::Gentle);
        }
    }

    /// Hand `w`, just taken off the list, to its mutex; or wake it outright if it waits with a
    /// deadline (it must be able to time out).
    fn wakeup(w: &'static ThreadSlot<Platform>) {
        let waitp = w.wait_params();
        match waitp.transfer_target() {
            Some(mu) if !waitp.has_deadline() => mu.transfer(w),
            _ => wakeup_slot(w),
        }
    }

    /// Wake the longest-waiting thread, if any.
    pub fn signal(&self) {
        let mut c = 0;
        loop {
            let v = self.word.load(Ordering::Relaxed);
            if v == 0 {
                return;
            }
            if v & CV_SPIN == 0
                && self
                    .word
                    .compare_exchange(v, v | CV_SPIN, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                let mut h = tail::<Platform>(v);
                let mut w = None;
                if let Some(head) = h {
                    let first = head.next.follow();
                    if ptr::eq(first, head) {
                        h = None;
                    } else {
                        head.next.set(first.next.get());
                    }
                    w = Some(first);
                }
                self.word
                    .store(with_tail(v & CV_EVENT, h), Ordering::Release);
                if let Some(w) = w {
                    Self::wakeup(w);
                }
                if v & CV_EVENT != 0 {
                    self.post_event(SyncEventKind::Signal);
                }
                return;
            }
            c = delay(self.platform, c, DelayMode::Gentle);
        }
    }

    /// Wake every waiting thread.
    pub fn signal_all(&self) {
        let mut c = 0;
        loop {
            let v = self.word.load(Ordering::Relaxed);
            if v == 0 {
                return;
            }
            // Empty the list in one go; nobody else can touch it afterwards.
            if v & CV_SPIN == 0
                && self
                    .word
                    .compare_exchange(v, v & CV_EVENT, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                if let Some(h) = tail::<Platform>(v) {
                    let mut n = h.next.follow();
                    loop {
                        let w = n;
                        n = w.next.follow();
                        Self::wakeup(w);
                        if ptr::eq(w, h) {
                            break;
                        }
                    }
                }
                if v & CV_EVENT != 0 {
                    self.post_event(SyncEventKind::SignalAll);
                }
                return;
            }
            c = delay(self.platform, c, DelayMode::Gentle);
        }
    }

    /// Log every operation on this condvar, under `name`, through the platform debug log.
    pub fn enable_debug_log(&self, name: &str) {
        let event = self.events.ensure();
        event.set_name(name);
        event.set_log(true);
        set_bits_when_clear(&self.word, CV_EVENT, CV_SPIN);
    }
}

impl<Platform: 'static> core::fmt::Debug for CondVar<Platform> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CondVar")
            .field("word", &format_args!("{:#x}", self.word.load(Ordering::Relaxed)))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;
    use std::thread;

    use super::*;
    use crate::platform::mock::MockPlatform;
    use crate::platform::TimeProvider as _;

    #[test]
    fn signalling_nobody_is_a_no_op() {
        let platform = MockPlatform::new();
        let cv = CondVar::new(platform);
        cv.signal();
        cv.signal_all();
        assert_eq!(cv.word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn waits_time_out_with_the_mutex_held() {
        let platform = MockPlatform::new();
        let mu = Mutex::new(platform);
        let cv = CondVar::new(platform);
        mu.lock();
        assert!(cv.wait_with_timeout(&mu, Duration::from_millis(10)));
        mu.assert_held();
        assert_eq!(cv.word.load(Ordering::Relaxed), 0);
        mu.unlock();
        mu.reader_lock();
        let deadline = platform.now().checked_add(Duration::from_millis(5)).unwrap();
        assert!(cv.wait_with_deadline(&mu, deadline));
        mu.assert_reader_held();
        mu.reader_unlock();
    }

    #[test]
    fn waiters_are_signalled_oldest_first() {
        let platform = MockPlatform::new();
        let mu: &'static Mutex<MockPlatform> = Box::leak(Box::new(Mutex::new(platform)));
        let cv: &'static CondVar<MockPlatform> = Box::leak(Box::new(CondVar::new(platform)));
        let order: &'static spin::Mutex<std::vec::Vec<usize>> =
            Box::leak(Box::new(spin::Mutex::new(std::vec::Vec::new())));
        let mut waiters = std::vec::Vec::new();
        for i in 0..3 {
            waiters.push(thread::spawn(move || {
                mu.lock();
                order.lock().push(i);
                cv.wait(mu);
                order.lock().push(10 + i);
                mu.unlock();
            }));
            // Wait until `i` is on the list before starting the next one.
            loop {
                mu.lock();
                let queued = order.lock().len() == i + 1;
                mu.unlock();
                if queued {
                    break;
                }
                thread::yield_now();
            }
        }
        for i in 0..3 {
            mu.lock();
            cv.signal();
            mu.unlock();
            loop {
                mu.lock();
                let woken = order.lock().len() == 4 + i;
                mu.unlock();
                if woken {
                    break;
                }
                thread::yield_now();
            }
        }
        for w in waiters {
            w.join().unwrap();
        }
        assert_eq!(*order.lock(), [0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn debug_logging_records_waits_and_signals() {
        let platform = MockPlatform::new();
        let mu = Mutex::new(platform);
        let cv = CondVar::new(platform);
        cv.enable_debug_log("ready");
        mu.lock();
        cv.wait_with_timeout(&mu, Duration::from_millis(1));
        mu.unlock();
        cv.signal();
        cv.signal_all();
        let log = platform.take_log();
        for expected in ["Wait on ", "Wait unblocked ", "Signal on ", "SignalAll on ", "ready"] {
            assert!(log.contains(expected), "{expected:?} missing from {log}");
        }
    }
}
