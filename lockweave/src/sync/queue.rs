// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The mutex waiter queue.
//!
//! Waiters form a circular singly-linked list through [`ThreadSlot::next`]. The lock word points
//! at the *head*, which is the most recently queued waiter; `head.next` is the oldest one.
//!
//! Runs of consecutive waiters that wait for the same thing (see [`equivalent_waiters`]) are
//! chained through `skip` links, so that a releaser scanning for wakeable waiters can evaluate
//! each distinct condition only once. A skip link only ever points forward within such a run,
//! and never out of the head (which a scanning releaser uses as its terminator).
//!
//! Everything here runs with the `SPIN` bit (or both `SPIN` and the lock itself) held.

use core::ptr;
use core::sync::atomic::Ordering;

use bitflags::bitflags;

use super::condition::Condition;
use super::condvar::condvar_enqueue;
use super::mutex::Mutex;
use super::thread_slot::{ThreadSlot, WaitParams};
use super::word::LockMode;
use super::RawSyncPrimitivesProvider;
use crate::platform::ThreadProvider;

bitflags! {
    /// How a waiter is being queued.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct EnqueueFlags: u8 {
        /// The waiter has already blocked at least once during this acquisition.
        const HAS_BLOCKED = 1 << 0;
        /// The waiter waits for a condition (or a condvar), not just the lock.
        const IS_COND = 1 << 1;
        /// The waiter is being moved over from a condvar by another thread.
        const IS_FER = 1 << 2;
    }
}

type Head<Platform> = Option<&'static ThreadSlot<Platform>>;

/// Whether `x` and `y` wait for the same thing, so that waking one is as good as waking the
/// other. Both must be queued.
pub(crate) fn equivalent_waiters<Platform: ThreadProvider>(
    x: &ThreadSlot<Platform>,
    y: &ThreadSlot<Platform>,
) -> bool {
    let (xw, yw) = (x.wait_params(), y.wait_params());
    xw.how == yw.how
        && x.priority.load(Ordering::Relaxed) == y.priority.load(Ordering::Relaxed)
        && Condition::guaranteed_equal(xw.condition(), yw.condition())
}

/// The last waiter of the skip chain starting at `x`, compressing the chain along the way.
pub(crate) fn skip<Platform: ThreadProvider>(
    x: &'static ThreadSlot<Platform>,
) -> &'static ThreadSlot<Platform> {
    let Some(mut x2) = x.skip.get() else {
        return x;
    };
    let mut x1 = x;
    loop {
        let x0 = x1;
        x1 = x2;
        match x2.skip.get() {
            Some(next) => {
                x0.skip.set(Some(next));
                x2 = next;
            }
            None => break,
        }
    }
    x.skip.set(Some(x1));
    x1
}

/// `removed` is about to leave the queue; make sure `ancestor` does not skip to it.
pub(crate) fn fix_skip<Platform: ThreadProvider>(
    ancestor: &ThreadSlot<Platform>,
    removed: &ThreadSlot<Platform>,
) {
    if !ancestor.skip.is(removed) {
        return;
    }
    if !removed.skip.is_none() {
        ancestor.skip.set(removed.skip.get());
    } else if !ancestor.next.is(removed) {
        ancestor.skip.set(ancestor.next.get());
    } else {
        ancestor.skip.set(None);
    }
}

/// Unlink the successor of `pw`, returning the new head (`None` if the queue is now empty).
pub(crate) fn dequeue<Platform: ThreadProvider>(
    head: &'static ThreadSlot<Platform>,
    pw: &'static ThreadSlot<Platform>,
) -> Head<Platform> {
    let w = pw.next.follow();
    pw.next.set(w.next.get());
    if ptr::eq(head, w) {
        return if ptr::eq(pw, w) { None } else { Some(pw) };
    }
    if !ptr::eq(pw, head) && equivalent_waiters(pw, pw.next.follow()) {
        pw.skip.set(pw.next.get());
    }
    Some(head)
}

/// Queue `waitp.thread` on the queue whose head is `head` (or, for a pending condvar wait, on the
/// condvar instead), returning the new head.
///
/// `word` is the lock word as last observed; a waiter that starts a new queue carries its reader
/// count.
pub(crate) fn enqueue<Platform: RawSyncPrimitivesProvider>(
    mu: &Mutex<Platform>,
    head: Head<Platform>,
    waitp: &WaitParams<Platform>,
    word: usize,
    flags: EnqueueFlags,
) -> Head<Platform> {
    if let Some(cv_word) = waitp.take_cv_word() {
        if let Err(fault) = condvar_enqueue(mu.platform, cv_word, waitp) {
            mu.fatal(fault);
        }
        return head;
    }

    let s = waitp.thread;
    if let Err(fault) = s.begin_wait(waitp) {
        mu.fatal(fault);
    }
    s.skip.set(None);
    s.may_skip.store(true, Ordering::Relaxed);
    s.wake.store(false, Ordering::Relaxed);
    s.cond_waiter
        .store(flags.contains(EnqueueFlags::IS_COND), Ordering::Relaxed);
    if !flags.contains(EnqueueFlags::IS_FER) {
        s.refresh_priority(mu.platform);
    }

    let new_head = match head {
        None => {
            s.next.set(Some(s));
            s.readers.store(word, Ordering::Relaxed);
            s.maybe_unlocking.store(false, Ordering::Relaxed);
            s
        }
        Some(head) => enqueue_nonempty(head, s, waitp, flags),
    };
    s.mark_queued();
    Some(new_head)
}

fn enqueue_nonempty<Platform: ThreadProvider>(
    head: &'static ThreadSlot<Platform>,
    s: &'static ThreadSlot<Platform>,
    waitp: &WaitParams<Platform>,
    flags: EnqueueFlags,
) -> &'static ThreadSlot<Platform> {
    let priority = s.priority.load(Ordering::Relaxed);
    let unconditional_writer = waitp.how == LockMode::Exclusive && !waitp.has_condition();
    let unlocking = head.maybe_unlocking.load(Ordering::Relaxed);

    let mut enqueue_after = None;
    if priority > head.priority.load(Ordering::Relaxed) {
        if !unlocking {
            // Priority-FIFO order. Waiters within a skip chain share a priority, so whole chains
            // can be passed at once. Terminates at the head, whose priority is lower.
            let mut advance_to = head;
            loop {
                let after = advance_to;
                advance_to = skip(after.next.follow());
                enqueue_after = Some(after);
                if priority > advance_to.priority.load(Ordering::Relaxed) {
                    break;
                }
            }
        } else if unconditional_writer {
            // A scanning releaser re-checks the front of the queue for exactly this kind of
            // waiter.
            enqueue_after = Some(head);
        }
    }

    if let Some(after) = enqueue_after {
        s.next.set(after.next.get());
        after.next.set(Some(s));
        debug_assert!(
            after.skip.is_none() || equivalent_waiters(after, s),
            "Mutex enqueue failure"
        );
        if !ptr::eq(after, head)
            && after.may_skip.load(Ordering::Relaxed)
            && equivalent_waiters(after, after.next.follow())
        {
            after.skip.set(after.next.get());
        }
        if equivalent_waiters(s, s.next.follow()) {
            s.skip.set(s.next.get());
        }
        head
    } else if flags.contains(EnqueueFlags::HAS_BLOCKED)
        && priority >= head.next.follow().priority.load(Ordering::Relaxed)
        && (!unlocking
            || (waitp.how == LockMode::Exclusive
                && Condition::guaranteed_equal(waitp.condition(), None)))
    {
        // Woken, but lost the race for the lock: go back to the front rather than wait out the
        // whole queue again.
        s.next.set(head.next.get());
        head.next.set(Some(s));
        if equivalent_waiters(s, s.next.follow()) {
            s.skip.set(s.next.get());
        }
        head
    } else {
        // Append: s becomes the new head, and inherits the head-only fields.
        s.next.set(head.next.get());
        head.next.set(Some(s));
        s.readers
            .store(head.readers.load(Ordering::Relaxed), Ordering::Relaxed);
        s.maybe_unlocking.store(unlocking, Ordering::Relaxed);
        if head.may_skip.load(Ordering::Relaxed) && equivalent_waiters(head, s) {
            head.skip.set(Some(s));
        }
        s
    }
}

/// Threads removed from a queue, to be woken once the lock word has been released.
///
/// Chained through `next`; the last element links to itself, so a slot on the list always has a
/// non-empty `next` until it is woken.
pub(crate) struct WakeList<Platform: ThreadProvider> {
    first: Head<Platform>,
    last: Head<Platform>,
}

impl<Platform: ThreadProvider> WakeList<Platform> {
    pub(crate) const fn new() -> Self {
        Self {
            first: None,
            last: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    fn push(&mut self, w: &'static ThreadSlot<Platform>) {
        w.next.set(Some(w));
        match self.last {
            Some(last) => last.next.set(Some(w)),
            None => self.first = Some(w),
        }
        self.last = Some(w);
    }

    /// Wake everyone on the list.
    pub(crate) fn wake_all(self) {
        let mut cur = self.first;
        while let Some(w) = cur {
            let next = w.next.follow();
            cur = if ptr::eq(next, w) { None } else { Some(next) };
            wakeup(w);
        }
    }
}

/// Hand `w` back to its owner, and unpark it.
pub(crate) fn wakeup<Platform: ThreadProvider>(w: &ThreadSlot<Platform>) {
    w.next.set(None);
    w.mark_available();
    w.unpark();
}

/// Move every waiter marked `wake` in `[pw.next, head]` onto `wake_list`, stopping after the
/// first writer. Returns the new head.
pub(crate) fn dequeue_all_wakeable<Platform: ThreadProvider>(
    head: &'static ThreadSlot<Platform>,
    mut pw: &'static ThreadSlot<Platform>,
    wake_list: &mut WakeList<Platform>,
) -> Head<Platform> {
    let mut w = pw.next.follow();
    let mut skipped = false;
    loop {
        if w.wake.load(Ordering::Relaxed) {
            debug_assert!(
                pw.skip.is_none(),
                "bad skip while collecting wakeable waiters"
            );
            let new_head = dequeue(head, pw);
            wake_list.push(w);
            match new_head {
                Some(h) if ptr::eq(h, head) => {}
                // The head itself was taken; there is nothing left to consider.
                other => return other,
            }
            if w.wait_params().how == LockMode::Exclusive {
                return Some(head);
            }
        } else {
            pw = skip(w);
            skipped = true;
        }
        // Skipping from the head advances by exactly one, so having skipped onto the head means
        // the head has been considered.
        if skipped && ptr::eq(pw, head) {
            return Some(head);
        }
        w = pw.next.follow();
    }
}
