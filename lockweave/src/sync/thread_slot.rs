// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-thread waiter slots, the wait parameters of a single blocking call, and the registry
//! that recycles slots across threads.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use super::condition::Condition;
use super::deadlock::HeldLocks;
use super::fault::SyncFault;
use super::mutex::Mutex;
use super::word::LockMode;
use crate::platform::{Instant as _, RawMutex, SchedulerProvider, ThreadProvider};

/// A possibly-empty link to another [`ThreadSlot`].
///
/// All links are only ever modified by a thread that holds the `SPIN` bit of the owning queue
/// (or the whole mutex), so relaxed accesses suffice; the lock word publishes them.
pub(crate) struct Link<Platform: ThreadProvider>(AtomicPtr<ThreadSlot<Platform>>);

impl<Platform: ThreadProvider> Link<Platform> {
    const fn new() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    pub(crate) fn get(&self) -> Option<&'static ThreadSlot<Platform>> {
        // SAFETY: links only ever point at slots handed out by a `ThreadRegistry` (or an
        // equivalent platform pool), which are leaked and never freed.
        unsafe { self.0.load(Ordering::Relaxed).as_ref() }
    }

    pub(crate) fn set(&self, to: Option<&ThreadSlot<Platform>>) {
        self.0.store(
            to.map_or(ptr::null_mut(), |s| ptr::from_ref(s).cast_mut()),
            Ordering::Relaxed,
        );
    }

    /// The target of a link that is known to be set, such as the `next` link of a queued slot.
    pub(crate) fn follow(&self) -> &'static ThreadSlot<Platform> {
        match self.get() {
            Some(slot) => slot,
            None => unreachable!("broken waiter queue link"),
        }
    }

    pub(crate) fn is(&self, slot: &ThreadSlot<Platform>) -> bool {
        ptr::eq(self.0.load(Ordering::Relaxed), slot)
    }

    pub(crate) fn is_none(&self) -> bool {
        self.0.load(Ordering::Relaxed).is_null()
    }
}

/// Slot is not on any queue.
const AVAILABLE: u32 = 0;
/// Slot is linked into a mutex or condvar queue.
const QUEUED: u32 = 1;

/// Where a thread is in its current blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitPhase {
    /// No blocking call in progress.
    Idle,
    /// Linked into a queue; only a waker (or a timeout) moves it on.
    Queued,
    /// Removed from the queue, but the blocking call has not yet returned.
    Waking,
}

/// The waiter node of one thread.
///
/// A slot is created once per thread (lazily, by the platform's thread identity registry) and
/// reused for every blocking call the thread makes. While queued, a slot is referenced (never
/// owned) by exactly one mutex or condvar queue.
///
/// Slots are aligned to 256 bytes so that their address fits into the high bits of a mutex's
/// lock word.
#[repr(align(256))]
pub struct ThreadSlot<Platform: ThreadProvider> {
    /// Circular successor in the queue.
    pub(crate) next: Link<Platform>,
    /// A later slot with an equivalent wait, or none.
    pub(crate) skip: Link<Platform>,
    /// Whether this slot may be the source of a skip.
    pub(crate) may_skip: AtomicBool,
    /// Chosen for wakeup by the releaser currently scanning the queue.
    pub(crate) wake: AtomicBool,
    /// Waiting on a condition (or condvar) rather than for the lock alone.
    pub(crate) cond_waiter: AtomicBool,
    /// On the queue head only: a releaser may be scanning the queue without `SPIN`.
    pub(crate) maybe_unlocking: AtomicBool,
    /// On the queue head only: the reader count displaced from the lock word.
    pub(crate) readers: AtomicUsize,
    pub(crate) priority: AtomicI32,
    state: AtomicU32,
    waitp: AtomicPtr<WaitParams<Platform>>,
    next_priority_read: spin::Mutex<Option<Platform::Instant>>,
    evaluating_condition: AtomicBool,
    sem: Platform::RawMutex,
    pub(crate) held: spin::Mutex<HeldLocks>,
}

impl<Platform: ThreadProvider> ThreadSlot<Platform> {
    fn new() -> Self {
        Self {
            next: Link::new(),
            skip: Link::new(),
            may_skip: AtomicBool::new(false),
            wake: AtomicBool::new(false),
            cond_waiter: AtomicBool::new(false),
            maybe_unlocking: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            priority: AtomicI32::new(0),
            state: AtomicU32::new(AVAILABLE),
            waitp: AtomicPtr::new(ptr::null_mut()),
            next_priority_read: spin::Mutex::new(None),
            evaluating_condition: AtomicBool::new(false),
            sem: <Platform::RawMutex as RawMutex>::INIT,
            held: spin::Mutex::new(HeldLocks::new()),
        }
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.state.load(Ordering::Acquire) == QUEUED
    }

    pub(crate) fn mark_queued(&self) {
        self.state.store(QUEUED, Ordering::Relaxed);
    }

    /// Hand the slot back to its owner. The owner may return from its blocking call as soon as
    /// it observes this, so nothing but `sem` may be touched afterwards.
    pub(crate) fn mark_available(&self) {
        self.state.store(AVAILABLE, Ordering::Release);
    }

    pub(crate) fn phase(&self) -> WaitPhase {
        if self.waitp.load(Ordering::Relaxed).is_null() {
            WaitPhase::Idle
        } else if self.state.load(Ordering::Acquire) == QUEUED {
            WaitPhase::Queued
        } else {
            WaitPhase::Waking
        }
    }

    /// Attach `waitp` for the duration of a blocking call.
    ///
    /// Re-attaching the same parameters is allowed: a condvar waiter is attached once when it
    /// joins the condvar queue and again when it is transferred onto the mutex queue.
    pub(crate) fn begin_wait(&self, waitp: &WaitParams<Platform>) -> Result<(), SyncFault> {
        let new = ptr::from_ref(waitp).cast_mut();
        let old = self.waitp.load(Ordering::Relaxed);
        if !old.is_null() && old != new {
            return Err(SyncFault::IllegalRecursion);
        }
        self.waitp.store(new, Ordering::Relaxed);
        Ok(())
    }

    /// Detach the parameters of the blocking call that just completed.
    pub(crate) fn end_wait(&self) -> Result<(), SyncFault> {
        if self.phase() == WaitPhase::Idle {
            return Err(SyncFault::IllegalRecursion);
        }
        self.waitp.store(ptr::null_mut(), Ordering::Relaxed);
        Ok(())
    }

    /// Undo a [`Self::begin_wait`] whose enqueue was never published.
    pub(crate) fn abandon_wait(&self) {
        self.waitp.store(ptr::null_mut(), Ordering::Relaxed);
        self.state.store(AVAILABLE, Ordering::Relaxed);
    }

    /// The wait parameters of a queued (or waking) slot.
    pub(crate) fn wait_params(&self) -> &WaitParams<Platform> {
        let p = self.waitp.load(Ordering::Relaxed);
        debug_assert!(!p.is_null(), "queued waiter without wait parameters");
        // SAFETY: parameters stay attached (and alive on their owner's stack) for as long as the
        // owner is blocked, and the owner only detaches them after it has been dequeued and
        // marked available; callers only reach slots that are still on a queue.
        unsafe { &*p }
    }

    pub(crate) fn is_evaluating_condition(&self) -> bool {
        self.evaluating_condition.load(Ordering::Relaxed)
    }

    pub(crate) fn set_evaluating_condition(&self, evaluating: bool) {
        self.evaluating_condition.store(evaluating, Ordering::Relaxed);
    }

    /// Every so often, update our idea of the thread's priority.
    pub(crate) fn refresh_priority(&self, platform: &Platform)
    where
        Platform: SchedulerProvider,
    {
        let now = platform.now();
        let mut next_read = self.next_priority_read.lock();
        if next_read.is_some_and(|t| now.checked_duration_since(&t).is_none()) {
            return;
        }
        self.priority
            .store(platform.current_priority(), Ordering::Relaxed);
        *next_read = now.checked_add(super::CONFIG_PRIORITY_REFRESH);
    }

    /// Block until [`Self::unpark`] is called, or `deadline` passes.
    ///
    /// Returns `false` if the deadline passed. May also return `true` spuriously, so callers
    /// must re-check whatever they are waiting for.
    pub(crate) fn park(&self, platform: &Platform, deadline: Option<Platform::Instant>) -> bool {
        let count = self.sem.underlying_atomic();
        loop {
            let c = count.load(Ordering::Acquire);
            if c > 0 {
                if count
                    .compare_exchange(c, c - 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }
            match deadline {
                None => {
                    let _ = self.sem.block(0);
                }
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(&platform.now()) else {
                        return false;
                    };
                    if remaining.is_zero() {
                        return false;
                    }
                    let _ = self.sem.block_or_timeout(0, remaining);
                }
            }
        }
    }

    /// Post one wakeup to the owner of this slot. Posts are counted, never lost.
    pub(crate) fn unpark(&self) {
        self.sem.underlying_atomic().fetch_add(1, Ordering::Release);
        self.sem.wake_one();
    }

    fn reset(&self) {
        debug_assert_eq!(self.phase(), WaitPhase::Idle);
        self.next.set(None);
        self.skip.set(None);
        self.priority.store(0, Ordering::Relaxed);
        *self.next_priority_read.lock() = None;
        self.set_evaluating_condition(false);
        self.held.lock().clear();
    }
}

/// Parameters of one blocking call. Lives on the blocked thread's stack.
pub(crate) struct WaitParams<Platform: ThreadProvider> {
    pub(crate) how: LockMode,
    cond: AtomicPtr<Condition<'static>>,
    deadline: Option<Platform::Instant>,
    has_deadline: AtomicBool,
    /// The mutex to transfer to on a condvar signal; null for plain mutex waits.
    cvmu: *const Mutex<Platform>,
    /// The condvar to queue on instead of the mutex, until the first enqueue consumes it.
    cv_word: AtomicPtr<AtomicUsize>,
    pub(crate) thread: &'static ThreadSlot<Platform>,
}

impl<Platform: ThreadProvider> WaitParams<Platform> {
    pub(crate) fn new(
        how: LockMode,
        cond: Option<&Condition<'_>>,
        deadline: Option<Platform::Instant>,
        thread: &'static ThreadSlot<Platform>,
    ) -> Self {
        Self {
            how,
            cond: AtomicPtr::new(
                cond.map_or(ptr::null_mut(), |c| {
                    ptr::from_ref(c).cast::<Condition<'static>>().cast_mut()
                }),
            ),
            deadline,
            has_deadline: AtomicBool::new(deadline.is_some()),
            cvmu: ptr::null(),
            cv_word: AtomicPtr::new(ptr::null_mut()),
            thread,
        }
    }

    /// Parameters for a condvar wait: queue on `cv_word`, and later transfer to `mutex`.
    pub(crate) fn for_condvar(
        how: LockMode,
        deadline: Option<Platform::Instant>,
        mutex: &Mutex<Platform>,
        cv_word: &AtomicUsize,
        thread: &'static ThreadSlot<Platform>,
    ) -> Self {
        let mut waitp = Self::new(how, None, deadline, thread);
        waitp.cvmu = ptr::from_ref(mutex);
        waitp.cv_word = AtomicPtr::new(ptr::from_ref(cv_word).cast_mut());
        waitp
    }

    /// The condition of this wait, if it has not been satisfied or abandoned.
    pub(crate) fn condition(&self) -> Option<&Condition<'_>> {
        // SAFETY: the condition outlives the blocking call that these parameters belong to.
        unsafe { self.cond.load(Ordering::Relaxed).as_ref() }
    }

    pub(crate) fn has_condition(&self) -> bool {
        !self.cond.load(Ordering::Relaxed).is_null()
    }

    pub(crate) fn clear_condition(&self) {
        self.cond.store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// The deadline of this wait, unless it has already expired or been cleared.
    pub(crate) fn deadline(&self) -> Option<Platform::Instant> {
        if self.has_deadline.load(Ordering::Relaxed) {
            self.deadline
        } else {
            None
        }
    }

    pub(crate) fn has_deadline(&self) -> bool {
        self.has_deadline.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_deadline(&self) {
        self.has_deadline.store(false, Ordering::Relaxed);
    }

    pub(crate) fn transfer_target(&self) -> Option<&Mutex<Platform>> {
        // SAFETY: a condvar waiter borrows its mutex for the whole wait.
        unsafe { self.cvmu.as_ref() }
    }

    pub(crate) fn take_cv_word(&self) -> Option<&AtomicUsize> {
        let p = self.cv_word.swap(ptr::null_mut(), Ordering::Relaxed);
        // SAFETY: the condvar outlives every wait on it.
        unsafe { p.as_ref() }
    }

    pub(crate) fn has_cv_word(&self) -> bool {
        !self.cv_word.load(Ordering::Relaxed).is_null()
    }
}

/// A recycling pool of [`ThreadSlot`]s.
///
/// Slots are leaked on first creation and returned to the pool when their thread exits, so a
/// pointer to a slot is valid for the rest of the process even if it is stale.
pub struct ThreadRegistry<Platform: ThreadProvider> {
    free: spin::Mutex<Vec<&'static ThreadSlot<Platform>>>,
}

impl<Platform: ThreadProvider> ThreadRegistry<Platform> {
    pub const fn new() -> Self {
        Self {
            free: spin::Mutex::new(Vec::new()),
        }
    }

    /// Take a slot for the calling thread.
    pub fn acquire(&self) -> &'static ThreadSlot<Platform> {
        if let Some(slot) = self.free.lock().pop() {
            return slot;
        }
        Box::leak(Box::new(ThreadSlot::new()))
    }

    /// Return a slot whose thread is exiting.
    pub fn release(&self, slot: &'static ThreadSlot<Platform>) {
        slot.reset();
        self.free.lock().push(slot);
    }
}

impl<Platform: ThreadProvider> Default for ThreadRegistry<Platform> {
    fn default() -> Self {
        Self::new()
    }
}

/// A slot on loan from a [`ThreadRegistry`], returned when dropped.
///
/// Meant to live in a thread-local, so that the slot goes back to the pool when its thread
/// exits.
pub struct SlotLease<Platform: ThreadProvider> {
    registry: &'static ThreadRegistry<Platform>,
    slot: &'static ThreadSlot<Platform>,
}

impl<Platform: ThreadProvider> SlotLease<Platform> {
    pub fn new(registry: &'static ThreadRegistry<Platform>) -> Self {
        Self {
            registry,
            slot: registry.acquire(),
        }
    }

    pub fn slot(&self) -> &'static ThreadSlot<Platform> {
        self.slot
    }
}

impl<Platform: ThreadProvider> Drop for SlotLease<Platform> {
    fn drop(&mut self) {
        self.registry.release(self.slot);
    }
}
