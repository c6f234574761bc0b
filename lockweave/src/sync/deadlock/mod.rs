// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deadlock-cycle detection over the historical lock acquisition order.
//!
//! Every acquisition made while other mutexes are held records "held-before-acquired" edges in a
//! process-wide [`LockGraph`]. An edge that would close a cycle indicates that two threads could
//! deadlock by acquiring the same mutexes in opposite orders, whether or not they ever actually
//! did.

mod graph;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use arrayvec::ArrayVec;

use super::fault::SyncFault;
use super::{
    CONFIG_MAX_CYCLE_PATH, CONFIG_MAX_HELD_LOCKS, CONFIG_STACK_DEPTH, CONFIG_SYMBOLIZED_REPORTS,
    RawSyncPrimitivesProvider,
};
pub(crate) use graph::GraphId;
use graph::LockGraph;

/// What to do when an acquisition would close a cycle in the lock ordering graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OnDeadlockCycle {
    /// Do not track lock ordering at all.
    Ignore,
    /// Log the cycle, and continue.
    Report,
    /// Log the cycle, and die.
    Abort,
}

const DEFAULT_MODE: OnDeadlockCycle = if cfg!(debug_assertions) {
    OnDeadlockCycle::Abort
} else {
    OnDeadlockCycle::Ignore
};

static MODE: AtomicU8 = AtomicU8::new(DEFAULT_MODE as u8);
static REPORTED_CYCLES: AtomicUsize = AtomicUsize::new(0);

static GRAPH: spin::Lazy<spin::Mutex<LockGraph>> =
    spin::Lazy::new(|| spin::Mutex::new(LockGraph::new()));

/// Set the process-wide deadlock detection mode.
///
/// Debug builds default to [`OnDeadlockCycle::Abort`], release builds to
/// [`OnDeadlockCycle::Ignore`]. Locks acquired while detection is off are not tracked, so the
/// mode should be set before any mutex is used.
pub fn set_deadlock_detection_mode(mode: OnDeadlockCycle) {
    MODE.store(mode as u8, Ordering::Release);
}

/// The current process-wide deadlock detection mode.
pub fn deadlock_detection_mode() -> OnDeadlockCycle {
    match MODE.load(Ordering::Acquire) {
        0 => OnDeadlockCycle::Ignore,
        1 => OnDeadlockCycle::Report,
        _ => OnDeadlockCycle::Abort,
    }
}

/// Number of potential deadlock cycles reported so far by this process.
pub fn reported_cycles() -> usize {
    REPORTED_CYCLES.load(Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug)]
struct HeldLock {
    /// Address of the mutex, as of acquisition.
    mutex: usize,
    /// Times acquired by this thread (shared locks may be held more than once).
    count: u32,
    id: GraphId,
}

/// The mutexes held by one thread.
#[derive(Debug)]
pub(crate) struct HeldLocks {
    locks: ArrayVec<HeldLock, CONFIG_MAX_HELD_LOCKS>,
    /// More locks were acquired than could be tracked.
    overflow: bool,
}

impl HeldLocks {
    pub(crate) const fn new() -> Self {
        Self {
            locks: ArrayVec::new_const(),
            overflow: false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.locks.clear();
        self.overflow = false;
    }

    fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn contains(&self, id: GraphId) -> bool {
        self.locks.iter().any(|l| l.id == id)
    }

    fn ids(&self) -> impl Iterator<Item = GraphId> + '_ {
        self.locks.iter().map(|l| l.id)
    }

    fn enter(&mut self, mutex: usize, id: GraphId) {
        if let Some(held) = self.locks.iter_mut().find(|l| l.id == id) {
            held.count += 1;
            return;
        }
        if self
            .locks
            .try_push(HeldLock {
                mutex,
                count: 1,
                id,
            })
            .is_err()
        {
            self.overflow = true;
        }
    }

    fn leave(&mut self, mutex: usize, id: GraphId) -> Result<(), SyncFault> {
        let found = self
            .locks
            .iter()
            .position(|l| id.is_valid() && l.id == id)
            .or_else(|| self.locks.iter().position(|l| l.mutex == mutex));
        match found {
            Some(i) if self.locks[i].count > 1 => self.locks[i].count -= 1,
            Some(i) => {
                self.locks.swap_remove(i);
            }
            None if self.overflow => {}
            None => return Err(SyncFault::ReleasingUnheld),
        }
        Ok(())
    }
}

/// The graph id of the mutex at `addr`, creating (and caching) it if necessary.
fn graph_id(cache: &AtomicU64, addr: usize) -> GraphId {
    let raw = cache.load(Ordering::Acquire);
    if raw != 0 {
        return GraphId::from_raw(raw);
    }
    let mut graph = GRAPH.lock();
    let cached = GraphId::from_raw(cache.load(Ordering::Acquire));
    let id = graph.get_or_create_id(cached, addr);
    cache.store(id.to_raw(), Ordering::Release);
    id
}

/// Forget the mutex whose graph id is cached in `cache`; its edges go with it.
pub(crate) fn forget(cache: &mut AtomicU64) {
    let raw = *cache.get_mut();
    if raw != 0 {
        GRAPH.lock().remove_node(GraphId::from_raw(raw));
        *cache.get_mut() = 0;
    }
}

/// Check that acquiring the mutex at `addr` does not close a cycle in the lock ordering graph,
/// recording the new edges if it doesn't. Returns the mutex's graph id (or
/// [`GraphId::INVALID`] if detection is off), to be handed to [`lock_enter`].
///
/// Fails on recursive acquisition, and on a cycle when detection is set to abort. In report
/// mode, a cycle is only logged, and at most one cycle is reported per acquisition.
pub(crate) fn deadlock_check<Platform: RawSyncPrimitivesProvider>(
    platform: &Platform,
    cache: &AtomicU64,
    addr: usize,
) -> Result<GraphId, SyncFault> {
    if deadlock_detection_mode() == OnDeadlockCycle::Ignore {
        return Ok(GraphId::INVALID);
    }
    let held: ArrayVec<GraphId, CONFIG_MAX_HELD_LOCKS> = {
        let held = platform.current_thread().held.lock();
        if held.is_empty() {
            drop(held);
            return Ok(graph_id(cache, addr));
        }
        held.ids().collect()
    };
    let id = graph_id(cache, addr);
    if held.contains(&id) {
        return Err(SyncFault::RecursiveLock);
    }

    let mut graph = GRAPH.lock();
    graph.update_stack_trace(id, held.len() + 1, || {
        Box::new(platform.capture_stack(CONFIG_STACK_DEPTH))
    });
    for &other in &held {
        if graph.ptr(other).is_none() {
            // Destroyed while held; its edges are gone already.
            continue;
        }
        if graph.insert_edge(other, id) {
            continue;
        }

        let nth = REPORTED_CYCLES.fetch_add(1, Ordering::Relaxed) + 1;
        let symbolize = nth <= CONFIG_SYMBOLIZED_REPORTS;
        if symbolize {
            let stack = platform.capture_stack(CONFIG_STACK_DEPTH);
            debug_log_println!(platform, "Potential Mutex deadlock: @ {stack}");
        } else {
            debug_log_println!(platform, "Potential Mutex deadlock");
        }
        {
            use core::fmt::Write as _;
            let mut w = super::log::DebugLogWriter::new(platform);
            let _ = write!(w, "Acquiring Mutex {addr:#x} while holding ");
            for h in &held {
                if let Some(p) = graph.ptr(*h) {
                    let _ = write!(w, " {p:#x}");
                }
            }
            let _ = writeln!(
                w,
                "; a cycle in the historical lock ordering graph has been observed"
            );
        }
        let path = graph.find_path(id, other);
        debug_log_println!(platform, "Cycle:");
        for &step in path.iter().take(CONFIG_MAX_CYCLE_PATH) {
            let ptr = graph.ptr(step).unwrap_or(0);
            match graph.stack_trace(step) {
                Some(stack) if symbolize => {
                    debug_log_println!(platform, "mutex@{ptr:#x} stack: {stack}");
                }
                _ => debug_log_println!(platform, "mutex@{ptr:#x}"),
            }
        }
        if path.len() > CONFIG_MAX_CYCLE_PATH {
            debug_log_println!(platform, "(long cycle; list truncated)");
        }
        if deadlock_detection_mode() == OnDeadlockCycle::Abort {
            drop(graph);
            return Err(SyncFault::PotentialDeadlock);
        }
        break;
    }
    Ok(id)
}

/// Record that the calling thread now holds the mutex at `addr`.
pub(crate) fn lock_enter<Platform: RawSyncPrimitivesProvider>(
    platform: &Platform,
    cache: &AtomicU64,
    addr: usize,
    id: GraphId,
) {
    if deadlock_detection_mode() == OnDeadlockCycle::Ignore {
        return;
    }
    let id = if id.is_valid() {
        id
    } else {
        graph_id(cache, addr)
    };
    platform.current_thread().held.lock().enter(addr, id);
}

/// Record that the calling thread no longer holds the mutex at `addr`.
pub(crate) fn lock_leave<Platform: RawSyncPrimitivesProvider>(
    platform: &Platform,
    cache: &AtomicU64,
    addr: usize,
) -> Result<(), SyncFault> {
    if deadlock_detection_mode() == OnDeadlockCycle::Ignore {
        return Ok(());
    }
    let id = GraphId::from_raw(cache.load(Ordering::Acquire));
    platform.current_thread().held.lock().leave(addr, id)
}

/// Whether the calling thread is known to hold the mutex whose graph id is cached in `cache`.
pub(crate) fn holds<Platform: RawSyncPrimitivesProvider>(
    platform: &Platform,
    cache: &AtomicU64,
) -> bool {
    if deadlock_detection_mode() == OnDeadlockCycle::Ignore {
        return false;
    }
    let id = GraphId::from_raw(cache.load(Ordering::Acquire));
    id.is_valid() && platform.current_thread().held.lock().contains(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(graph: &mut LockGraph, addr: usize) -> GraphId {
        graph.get_or_create_id(GraphId::INVALID, addr)
    }

    #[test]
    fn shared_locks_are_counted() {
        let mut graph = LockGraph::new();
        let a = id(&mut graph, 0x100);
        let mut held = HeldLocks::new();
        held.enter(0x100, a);
        held.enter(0x100, a);
        assert!(held.contains(a));
        held.leave(0x100, a).unwrap();
        assert!(held.contains(a));
        held.leave(0x100, a).unwrap();
        assert!(held.is_empty());
        assert!(matches!(
            held.leave(0x100, a),
            Err(SyncFault::ReleasingUnheld)
        ));
    }

    #[test]
    fn overflowed_sets_tolerate_unknown_releases() {
        let mut graph = LockGraph::new();
        let mut held = HeldLocks::new();
        for i in 1..=CONFIG_MAX_HELD_LOCKS + 1 {
            let g = id(&mut graph, i << 8);
            held.enter(i << 8, g);
        }
        assert_eq!(held.ids().count(), CONFIG_MAX_HELD_LOCKS);
        held.leave(0xdead00, GraphId::INVALID).unwrap();
        held.clear();
        assert!(held.is_empty());
        assert!(held.leave(0x100, GraphId::INVALID).is_err());
    }

    #[test]
    fn releases_fall_back_to_the_address() {
        let mut held = HeldLocks::new();
        let mut graph = LockGraph::new();
        let a = id(&mut graph, 0x100);
        held.enter(0x100, a);
        held.leave(0x100, GraphId::INVALID).unwrap();
        assert!(held.is_empty());
    }
}
