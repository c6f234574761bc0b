// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The contended paths of [`Mutex`]: queueing, blocking, waking, timeouts, and the transfer of
//! condvar waiters onto the mutex queue.

use core::ptr;
use core::sync::atomic::Ordering;

use super::RawSyncPrimitivesProvider;
use super::backoff::{DelayMode, delay};
use super::condition::Condition;
use super::events::SyncEventKind;
use super::fault::SyncFault;
use super::mutex::Mutex;
use super::queue::{
    EnqueueFlags, WakeList, dequeue, dequeue_all_wakeable, enqueue, equivalent_waiters, fix_skip,
    skip, wakeup,
};
use super::thread_slot::{ThreadSlot, WaitParams, WaitPhase};
use super::word::{
    DESIG, EVENT, HIGH, LOW, LockMode, ONE, READER, SPIN, WAIT, WRITER, WRWAIT,
    clear_designated_waker_mask, exactly_one_reader, ignore_waiting_writers_mask, queue_head,
    with_queue_head,
};

/// Evaluate `cond` on behalf of some waiter, flagging the calling thread as inside a condition
/// for the duration.
fn eval_condition<Platform: RawSyncPrimitivesProvider>(
    platform: &Platform,
    cond: &Condition<'_>,
) -> bool {
    let me = platform.current_thread();
    me.set_evaluating_condition(true);
    let res = cond.eval();
    me.set_evaluating_condition(false);
    res
}

fn lock_event(how: LockMode) -> SyncEventKind {
    match how {
        LockMode::Exclusive => SyncEventKind::Lock,
        LockMode::Shared => SyncEventKind::ReaderLock,
    }
}

fn lock_returning_event(how: LockMode) -> SyncEventKind {
    match how {
        LockMode::Exclusive => SyncEventKind::LockReturning,
        LockMode::Shared => SyncEventKind::ReaderLockReturning,
    }
}

impl<Platform: RawSyncPrimitivesProvider> Mutex<Platform> {
    /// The head of the queue in `v`, which must have `WAIT` set.
    fn head(v: usize) -> &'static ThreadSlot<Platform> {
        match queue_head(v) {
            Some(h) => h,
            None => unreachable!("waiter queue missing from lock word {v:#x}"),
        }
    }

    pub(crate) fn check_not_in_condition(&self) {
        if self.platform.current_thread().is_evaluating_condition() {
            self.fatal(SyncFault::ConditionReentry);
        }
    }

    fn check_not_waiting(&self, waitp: &WaitParams<Platform>) {
        if waitp.thread.phase() != WaitPhase::Idle {
            self.fatal(SyncFault::IllegalRecursion);
        }
    }

    /// Acquire in mode `how`, once `cond` (if any) holds. Cannot time out.
    pub(crate) fn lock_slow(
        &self,
        how: LockMode,
        cond: Option<&Condition<'_>>,
        flags: EnqueueFlags,
    ) {
        if !self.lock_slow_with_deadline(how, cond, None, flags) {
            self.fatal(SyncFault::ConditionUntrue);
        }
    }

    /// Acquire in mode `how`, waiting until `cond` (if any) holds or `deadline` passes.
    ///
    /// Always returns with the mutex held; the result is whether `cond` holds.
    pub(crate) fn lock_slow_with_deadline(
        &self,
        how: LockMode,
        cond: Option<&Condition<'_>>,
        deadline: Option<Platform::Instant>,
        mut flags: EnqueueFlags,
    ) -> bool {
        self.check_not_in_condition();
        let t = how.table();
        let v = self.word.load(Ordering::Relaxed);
        let mut unlock = false;
        if v & t.fast_need_zero == 0
            && self
                .word
                .compare_exchange(
                    v,
                    (t.fast_or
                        | (v & clear_designated_waker_mask(
                            flags.contains(EnqueueFlags::HAS_BLOCKED),
                        )))
                        + t.fast_add,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            match cond {
                None => return true,
                Some(c) if eval_condition(self.platform, c) => return true,
                Some(_) => unlock = true,
            }
        }

        let waitp = WaitParams::new(how, cond, deadline, self.platform.current_thread());
        if cond.is_some() {
            flags |= EnqueueFlags::IS_COND;
        }
        if unlock {
            self.unlock_slow(Some(&waitp));
            self.block(waitp.thread);
            flags |= EnqueueFlags::HAS_BLOCKED;
        }
        self.lock_slow_loop(&waitp, flags);
        waitp.has_condition() || cond.is_none_or(|c| eval_condition(self.platform, c))
    }

    /// Acquire for `waitp`, queueing and blocking as often as necessary.
    ///
    /// Returns once the mutex is held and either the condition of `waitp` holds, or the
    /// condition has been dropped because the wait timed out.
    pub(crate) fn lock_slow_loop(&self, waitp: &WaitParams<Platform>, mut flags: EnqueueFlags) {
        let t = waitp.how.table();
        let mut c = 0;
        let mut v = self.word.load(Ordering::Relaxed);
        if v & EVENT != 0 {
            self.post_event(lock_event(waitp.how));
        }
        self.check_not_waiting(waitp);
        loop {
            v = self.word.load(Ordering::Relaxed);
            self.check_for_corruption(v, "Lock");
            let has_blocked = flags.contains(EnqueueFlags::HAS_BLOCKED);
            let cdwm = clear_designated_waker_mask(has_blocked);
            if v & t.slow_need_zero == 0 {
                if self
                    .word
                    .compare_exchange(
                        v,
                        (t.fast_or | (v & cdwm)) + t.fast_add,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    if waitp
                        .condition()
                        .is_none_or(|cond| eval_condition(self.platform, cond))
                    {
                        break;
                    }
                    // Got the lock, but not the condition.
                    self.unlock_slow(Some(waitp));
                    self.block(waitp.thread);
                    flags |= EnqueueFlags::HAS_BLOCKED;
                    c = 0;
                }
            } else {
                let mut dowait = false;
                if v & (SPIN | WAIT) == 0 {
                    // Become the one and only waiter.
                    let Some(new_h) = enqueue(self, None, waitp, v, flags) else {
                        unreachable!("enqueue onto an empty queue failed");
                    };
                    let mut nv = (v & cdwm & LOW) | WAIT;
                    if waitp.how == LockMode::Exclusive && v & READER != 0 {
                        nv |= WRWAIT;
                    }
                    if self
                        .word
                        .compare_exchange(
                            v,
                            with_queue_head(nv, new_h),
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        dowait = true;
                    } else {
                        waitp.thread.abandon_wait();
                    }
                } else if v & t.slow_inc_need_zero & ignore_waiting_writers_mask(has_blocked) == 0 {
                    // A reader joining readers that hold the lock while others wait; the count
                    // lives in the queue head.
                    if self
                        .word
                        .compare_exchange(
                            v,
                            (v & cdwm) | SPIN | READER,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        Self::head(v).readers.fetch_add(ONE, Ordering::Relaxed);
                        self.release_spin(|v| (v & !SPIN) | READER);
                        if waitp
                            .condition()
                            .is_none_or(|cond| eval_condition(self.platform, cond))
                        {
                            break;
                        }
                        self.unlock_slow(Some(waitp));
                        self.block(waitp.thread);
                        flags |= EnqueueFlags::HAS_BLOCKED;
                        c = 0;
                    }
                } else if v & SPIN == 0
                    && self
                        .word
                        .compare_exchange(
                            v,
                            (v & cdwm) | SPIN | WAIT,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                {
                    let h = Self::head(v);
                    let Some(new_h) = enqueue(self, Some(h), waitp, v, flags) else {
                        unreachable!("enqueue onto a waiter queue failed");
                    };
                    let wr_wait = if waitp.how == LockMode::Exclusive && v & READER != 0 {
                        WRWAIT
                    } else {
                        0
                    };
                    self.release_spin(|v| {
                        with_queue_head((v & (LOW & !SPIN)) | WAIT | wr_wait, new_h)
                    });
                    dowait = true;
                }
                if dowait {
                    self.block(waitp.thread);
                    flags |= EnqueueFlags::HAS_BLOCKED;
                    c = 0;
                }
            }
            self.check_not_waiting(waitp);
            c = delay(self.platform, c, DelayMode::Gentle);
        }
        self.check_not_waiting(waitp);
        if v & EVENT != 0 {
            self.post_event(lock_returning_event(waitp.how));
        }
    }

    /// Release `SPIN`, replacing the word by `f(word)`; the rest of the word may still change
    /// under us (readers come and go).
    fn release_spin(&self, f: impl Fn(usize) -> usize) {
        let mut v = self.word.load(Ordering::Relaxed);
        while let Err(actual) =
            self.word
                .compare_exchange_weak(v, f(v), Ordering::Release, Ordering::Relaxed)
        {
            v = actual;
        }
    }

    /// Release the mutex (held in either mode), waking whoever should be woken.
    ///
    /// With `waitp`, the calling thread also queues itself (on the mutex, or on the condvar that
    /// `waitp` names) as part of the release, so that no wakeup can be missed; the caller must
    /// then [`Self::block`].
    pub(crate) fn unlock_slow(&self, waitp: Option<&WaitParams<Platform>>) {
        self.check_not_in_condition();
        let mut v = self.word.load(Ordering::Relaxed);
        self.assert_reader_held();
        self.check_for_corruption(v, "Unlock");
        if v & EVENT != 0 {
            self.post_event(if v & WRITER != 0 {
                SyncEventKind::Unlock
            } else {
                SyncEventKind::ReaderUnlock
            });
        }
        if let Some(waitp) = waitp {
            self.check_not_waiting(waitp);
        }

        let mut c = 0;
        // The first waiter chosen for wakeup, and its predecessor.
        let mut w: Option<&'static ThreadSlot<Platform>> = None;
        let mut pw: Option<&'static ThreadSlot<Platform>> = None;
        // The head as of the last (spin-free) scan of the queue.
        let mut old_h: Option<&'static ThreadSlot<Platform>> = None;
        let mut wake_list = WakeList::new();
        let mut wr_wait = 0;
        loop {
            v = self.word.load(Ordering::Relaxed);
            if v & WRITER != 0 && v & (WAIT | DESIG) != WAIT && waitp.is_none() {
                if self
                    .word
                    .compare_exchange(
                        v,
                        v & !(WRWAIT | WRITER),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
            } else if v & (READER | WAIT) == READER && waitp.is_none() {
                let clear = if exactly_one_reader(v) {
                    READER | ONE
                } else {
                    ONE
                };
                if self
                    .word
                    .compare_exchange(v, v - clear, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if v & SPIN == 0
                && self
                    .word
                    .compare_exchange(v, v | SPIN, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                if v & WAIT == 0 {
                    // Nobody to wake; we are about to sleep ourselves.
                    let Some(waitp) = waitp else {
                        unreachable!("contended release without waiters");
                    };
                    let mut do_enqueue = true;
                    loop {
                        v = self.word.load(Ordering::Relaxed);
                        let new_readers = if v >= ONE { v - ONE } else { v };
                        let mut new_h = None;
                        if do_enqueue {
                            // A condvar enqueue must happen exactly once: a retry would queue us
                            // on the mutex instead.
                            do_enqueue = !waitp.has_cv_word();
                            new_h = enqueue(self, None, waitp, new_readers, EnqueueFlags::IS_COND);
                        }
                        let clear = if v & WRITER == 0 && exactly_one_reader(v) {
                            WRWAIT | READER
                        } else {
                            WRWAIT | WRITER
                        };
                        let low = v & LOW & !clear & !SPIN;
                        let nv = match new_h {
                            Some(h) => with_queue_head(low | WAIT, h),
                            // Queued on a condvar; the reader count stays in the word.
                            None => low | (new_readers & HIGH),
                        };
                        if self
                            .word
                            .compare_exchange_weak(v, nv, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                        {
                            break;
                        }
                    }
                    break;
                }

                let h = Self::head(v);
                if v & READER != 0 && (h.readers.load(Ordering::Relaxed) & HIGH) > ONE {
                    // A reader, but not the last one.
                    h.readers.fetch_sub(ONE, Ordering::Relaxed);
                    let mut nv = v;
                    if let Some(waitp) = waitp {
                        let Some(new_h) = enqueue(self, Some(h), waitp, v, EnqueueFlags::IS_COND)
                        else {
                            unreachable!("waiters disappeared during enqueue");
                        };
                        nv = with_queue_head((v & LOW) | WAIT, new_h);
                    }
                    self.word.store(nv, Ordering::Release);
                    break;
                }

                debug_assert!(
                    old_h.is_none() || h.maybe_unlocking.load(Ordering::Relaxed),
                    "Mutex queue changed beneath us"
                );

                if let Some(oh) = old_h {
                    if !oh.may_skip.load(Ordering::Relaxed) {
                        // `oh` was our scan terminator; it may skip again.
                        oh.may_skip.store(true, Ordering::Relaxed);
                        debug_assert!(oh.skip.is_none(), "illegal skip from head");
                        if !ptr::eq(h, oh) && equivalent_waiters(oh, oh.next.follow()) {
                            oh.skip.set(oh.next.get());
                        }
                    }
                }

                let first = h.next.follow();
                let first_wait = first.wait_params();
                let start = if first_wait.how == LockMode::Exclusive
                    && !first_wait.has_condition()
                {
                    // An unconditional writer is first in line: no need to search. Let it win
                    // the race against any reader that is already awake.
                    first.wake.store(true, Ordering::Relaxed);
                    w = Some(first);
                    wr_wait = WRWAIT;
                    h
                } else if w.is_some_and(|w| {
                    w.wait_params().how == LockMode::Exclusive
                        || old_h.is_some_and(|oh| ptr::eq(oh, h))
                }) {
                    // Chosen on an earlier pass, and that pass saw everything there is to wake.
                    pw.unwrap_or(h)
                } else {
                    if old_h.is_some_and(|oh| ptr::eq(oh, h)) {
                        // Searched before, and nothing is new: nobody to wake.
                        let mut nv = v & !(READER | WRITER | WRWAIT);
                        h.readers.store(0, Ordering::Relaxed);
                        h.maybe_unlocking.store(false, Ordering::Relaxed);
                        if let Some(waitp) = waitp {
                            nv &= LOW;
                            if let Some(new_h) =
                                enqueue(self, Some(h), waitp, v, EnqueueFlags::IS_COND)
                            {
                                nv = with_queue_head(nv | WAIT, new_h);
                            }
                        }
                        self.word.store(nv, Ordering::Release);
                        break;
                    }

                    let (mut pw_walk, mut w_walk) = match old_h {
                        Some(oh) => (Some(oh), oh.next.follow()),
                        // The predecessor of `h.next` may change under us; don't record it.
                        None => (None, h.next.follow()),
                    };
                    h.may_skip.store(false, Ordering::Relaxed);
                    debug_assert!(h.skip.is_none(), "illegal skip from head");
                    h.maybe_unlocking.store(true, Ordering::Relaxed);

                    // Conditions are evaluated without SPIN. Holding the lock itself, the only
                    // possible change to the queue is waiters added between `h` and `w_walk`, so
                    // the path from `w_walk` to `h` stays intact.
                    self.word.store(v, Ordering::Release);
                    old_h = Some(h);

                    while !pw_walk.is_some_and(|p| ptr::eq(p, h)) {
                        w_walk.wake.store(false, Ordering::Relaxed);
                        let walk_wait = w_walk.wait_params();
                        if walk_wait
                            .condition()
                            .is_none_or(|cond| eval_condition(self.platform, cond))
                        {
                            if w.is_none() {
                                w_walk.wake.store(true, Ordering::Relaxed);
                                w = Some(w_walk);
                                pw = pw_walk;
                                if walk_wait.how == LockMode::Exclusive {
                                    wr_wait = WRWAIT;
                                    break;
                                }
                            } else if walk_wait.how == LockMode::Shared {
                                w_walk.wake.store(true, Ordering::Relaxed);
                            } else {
                                wr_wait = WRWAIT;
                            }
                        }
                        let next_pw = if w_walk.wake.load(Ordering::Relaxed) {
                            w_walk
                        } else {
                            skip(w_walk)
                        };
                        pw_walk = Some(next_pw);
                        // `h.next` may be racing with an enqueue; it is not needed anyway.
                        if !ptr::eq(next_pw, h) {
                            w_walk = next_pw.next.follow();
                        }
                    }
                    continue;
                };

                debug_assert!(
                    w.is_some_and(|w| start.next.is(w)),
                    "pw not w's predecessor"
                );
                let mut new_h = dequeue_all_wakeable(h, start, &mut wake_list);
                let mut nv = (v & EVENT) | DESIG;
                if let Some(waitp) = waitp {
                    new_h = enqueue(self, new_h, waitp, v, EnqueueFlags::IS_COND);
                }
                debug_assert!(!wake_list.is_empty(), "unexpected empty wake list");
                if let Some(h) = new_h {
                    h.readers.store(0, Ordering::Relaxed);
                    h.maybe_unlocking.store(false, Ordering::Relaxed);
                    nv = with_queue_head(nv | wr_wait | WAIT, h);
                }
                self.word.store(nv, Ordering::Release);
                break;
            }
            // Nobody else can make progress until we do.
            c = delay(self.platform, c, DelayMode::Aggressive);
        }
        wake_list.wake_all();
    }

    /// Park `s` (the calling thread) until a waker dequeues it. On timeout, remove it from the
    /// queue, and forget the deadline and the condition of its wait.
    pub(crate) fn block(&self, s: &'static ThreadSlot<Platform>) {
        while s.is_queued() {
            let waitp = s.wait_params();
            if !s.park(self.platform, waitp.deadline()) {
                self.try_remove(s);
                let mut c = 0;
                // Either removed now, or a waker has it and is about to hand it back.
                while !s.next.is_none() {
                    c = delay(self.platform, c, DelayMode::Gentle);
                    self.try_remove(s);
                }
                if cfg!(debug_assertions) {
                    // Also exercise removal of a thread that is no longer queued.
                    self.try_remove(s);
                }
                waitp.clear_deadline();
                waitp.clear_condition();
            }
        }
        if let Err(fault) = s.end_wait() {
            self.fatal(fault);
        }
    }

    /// Try to remove the timed-out waiter `s` from the queue. Only possible while the mutex is
    /// free, since both the lock and `SPIN` must be taken; otherwise the next releaser deals with
    /// `s`.
    fn try_remove(&self, s: &'static ThreadSlot<Platform>) {
        let v = self.word.load(Ordering::Relaxed);
        if v & (WAIT | SPIN | WRITER | READER) != WAIT
            || self
                .word
                .compare_exchange(v, v | SPIN | WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return;
        }
        let mut h = queue_head(v);
        if let Some(head) = h {
            let mut pw = head;
            let mut w = pw.next.follow();
            if !ptr::eq(w, s) {
                loop {
                    if equivalent_waiters(s, w) {
                        fix_skip(w, s);
                        pw = w;
                    } else {
                        pw = skip(w);
                    }
                    w = pw.next.follow();
                    if ptr::eq(w, s) || ptr::eq(pw, head) {
                        break;
                    }
                }
            }
            if ptr::eq(w, s) {
                h = dequeue(head, pw);
                s.next.set(None);
                s.mark_available();
            }
        }
        self.release_spin(|v| {
            let nv = v & (DESIG | EVENT);
            match h {
                Some(h) => {
                    h.readers.store(0, Ordering::Relaxed);
                    h.maybe_unlocking.store(false, Ordering::Relaxed);
                    with_queue_head(nv | WAIT, h)
                }
                None => nv,
            }
        });
    }

    /// Move the signalled condvar waiter `w` onto this mutex's queue, or wake it outright if it
    /// could take the mutex right away.
    pub(crate) fn transfer(&self, w: &'static ThreadSlot<Platform>) {
        let waitp = w.wait_params();
        debug_assert!(
            !waitp.has_condition(),
            "Mutex transfer while waiting on a Condition"
        );
        debug_assert!(
            !waitp.has_cv_word(),
            "Mutex transfer with pending condvar queueing"
        );
        // The condvar deadline does not apply to the mutex wait.
        waitp.clear_deadline();
        let flags = EnqueueFlags::IS_COND | EnqueueFlags::IS_FER;
        let mut c = 0;
        loop {
            let v = self.word.load(Ordering::Relaxed);
            let conflicting = WRITER
                | if waitp.how == LockMode::Shared {
                    0
                } else {
                    READER
                };
            if v & conflicting == 0 {
                // Nobody would wake it if it were queued.
                wakeup(w);
                return;
            }
            if v & (SPIN | WAIT) == 0 {
                let Some(new_h) = enqueue(self, None, waitp, v, flags) else {
                    unreachable!("enqueue onto an empty queue failed");
                };
                if self
                    .word
                    .compare_exchange(
                        v,
                        with_queue_head((v & LOW) | WAIT, new_h),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
            } else if v & SPIN == 0
                && self
                    .word
                    .compare_exchange(v, v | SPIN | WAIT, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                let h = Self::head(v);
                let Some(new_h) = enqueue(self, Some(h), waitp, v, flags) else {
                    unreachable!("enqueue onto a waiter queue failed");
                };
                self.release_spin(|v| with_queue_head((v & LOW & !SPIN) | WAIT, new_h));
                return;
            }
            c = delay(self.platform, c, DelayMode::Gentle);
        }
    }

    /// Release the mutex until `cond` holds (or `deadline` passes), then reacquire it in the
    /// mode it was held in. Returns whether `cond` holds.
    pub(crate) fn await_common(
        &self,
        cond: &Condition<'_>,
        deadline: Option<Platform::Instant>,
    ) -> bool {
        if cfg!(debug_assertions) {
            self.assert_reader_held();
        }
        if eval_condition(self.platform, cond) {
            return true;
        }
        let how = LockMode::held_in(self.word.load(Ordering::Relaxed));
        let waitp = WaitParams::new(how, Some(cond), deadline, self.platform.current_thread());
        self.unlock_slow(Some(&waitp));
        self.block(waitp.thread);
        self.lock_slow_loop(&waitp, EnqueueFlags::HAS_BLOCKED | EnqueueFlags::IS_COND);
        let res = waitp.has_condition() || eval_condition(self.platform, cond);
        if !res && deadline.is_none() {
            self.fatal(SyncFault::ConditionUntrue);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::sync::atomic::{AtomicBool, AtomicUsize};
    use core::time::Duration;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::platform::mock::MockPlatform;

    fn wait_for_word(mu: &Mutex<MockPlatform>, f: impl Fn(usize) -> bool) {
        while !f(mu.word.load(Ordering::Acquire)) {
            thread::yield_now();
        }
    }

    #[test]
    fn a_blocked_writer_owns_the_queue() {
        let platform = MockPlatform::new();
        let mu: &'static Mutex<MockPlatform> = std::boxed::Box::leak(std::boxed::Box::new(
            Mutex::new(platform),
        ));
        mu.lock();
        let waiter = thread::spawn(move || {
            mu.lock();
            mu.unlock();
        });
        wait_for_word(mu, |v| v & WAIT != 0);
        let h = Mutex::<MockPlatform>::head(mu.word.load(Ordering::Acquire));
        assert!(h.next.is(h));
        assert_eq!(h.wait_params().how, LockMode::Exclusive);
        mu.unlock();
        waiter.join().unwrap();
        assert_eq!(mu.word.load(Ordering::Relaxed) & (WRITER | READER | WAIT), 0);
    }

    #[test]
    fn writers_waiting_behind_readers_are_flagged() {
        let platform = MockPlatform::new();
        let mu: &'static Mutex<MockPlatform> = std::boxed::Box::leak(std::boxed::Box::new(
            Mutex::new(platform),
        ));
        mu.reader_lock();
        let writer = thread::spawn(move || {
            mu.lock();
            mu.unlock();
        });
        wait_for_word(mu, |v| v & WAIT != 0);
        let v = mu.word.load(Ordering::Acquire);
        assert_ne!(v & WRWAIT, 0);
        assert_ne!(v & READER, 0);
        // The displaced reader count moved into the queue head.
        let h = Mutex::<MockPlatform>::head(v);
        assert_eq!(h.readers.load(Ordering::Relaxed) & HIGH, ONE);
        // New readers queue behind the writer instead of barging in.
        assert!(!mu.reader_try_lock());
        mu.reader_unlock();
        writer.join().unwrap();
        assert_eq!(mu.word.load(Ordering::Relaxed) & (WRITER | READER | WAIT), 0);
    }

    #[test]
    fn timed_out_waiters_leave_the_queue() {
        let platform = MockPlatform::new();
        let mu: &'static Mutex<MockPlatform> = std::boxed::Box::leak(std::boxed::Box::new(
            Mutex::new(platform),
        ));
        let flag: &'static AtomicBool = std::boxed::Box::leak(std::boxed::Box::new(
            AtomicBool::new(false),
        ));
        let waiter = thread::spawn(move || {
            let cond = Condition::from_flag(flag);
            let res = mu.lock_when_with_timeout(&cond, Duration::from_millis(20));
            // Held either way.
            mu.assert_held();
            mu.unlock();
            res
        });
        assert!(!waiter.join().unwrap());
        assert_eq!(mu.word.load(Ordering::Relaxed) & (WRITER | READER | WAIT), 0);
    }

    #[test]
    fn releasers_evaluate_conditions_for_waiters() {
        let platform = MockPlatform::new();
        let mu = Arc::new(Mutex::new(platform));
        let value = Arc::new(AtomicUsize::new(0));
        let waiters: std::vec::Vec<_> = (1..=3)
            .map(|target| {
                let mu = Arc::clone(&mu);
                let value = Arc::clone(&value);
                thread::spawn(move || {
                    let reached = || value.load(Ordering::Relaxed) >= target;
                    mu.reader_lock_when(&Condition::new(&reached));
                    let seen = value.load(Ordering::Relaxed);
                    mu.reader_unlock();
                    seen
                })
            })
            .collect();
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(5));
            mu.lock();
            value.fetch_add(1, Ordering::Relaxed);
            mu.unlock();
        }
        for (target, w) in (1..=3).zip(waiters) {
            assert!(w.join().unwrap() >= target);
        }
    }
}
