// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use lockweave::sync::{CondVar, Mutex};
use lockweave_platform_linux_userland::LinuxUserland;

struct Shared {
    mutex: Mutex<LinuxUserland>,
    condvar: CondVar<LinuxUserland>,
    /// Threads currently inside `wait`.
    waiting: AtomicUsize,
    /// Threads that returned from `wait`.
    woken: AtomicUsize,
    /// Number of wake-ups handed out so far.
    permits: AtomicUsize,
}

fn shared() -> &'static Shared {
    let platform = LinuxUserland::new();
    Box::leak(Box::new(Shared {
        mutex: Mutex::new(platform),
        condvar: CondVar::new(platform),
        waiting: AtomicUsize::new(0),
        woken: AtomicUsize::new(0),
        permits: AtomicUsize::new(0),
    }))
}

fn spawn_waiters(s: &'static Shared, n: usize) -> Vec<thread::JoinHandle<()>> {
    (0..n)
        .map(|_| {
            thread::spawn(move || {
                s.mutex.lock();
                s.waiting.fetch_add(1, Ordering::Relaxed);
                // Tolerate spurious wake-ups: only leave with a permit.
                loop {
                    s.condvar.wait(&s.mutex);
                    let permits = s.permits.load(Ordering::Relaxed);
                    if permits > 0 {
                        s.permits.store(permits - 1, Ordering::Relaxed);
                        break;
                    }
                }
                s.waiting.fetch_sub(1, Ordering::Relaxed);
                s.woken.fetch_add(1, Ordering::Relaxed);
                s.mutex.unlock();
            })
        })
        .collect()
}

fn wait_until_waiting(s: &Shared, n: usize) {
    loop {
        {
            let _guard = s.mutex.guard();
            if s.waiting.load(Ordering::Relaxed) == n {
                return;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_signal_wakes_exactly_one() {
    let s = shared();
    let waiters = spawn_waiters(s, 5);
    wait_until_waiting(s, 5);

    s.mutex.lock();
    s.permits.fetch_add(1, Ordering::Relaxed);
    s.condvar.signal();
    s.mutex.unlock();

    thread::sleep(Duration::from_millis(100));
    {
        let _guard = s.mutex.guard();
        assert_eq!(s.woken.load(Ordering::Relaxed), 1);
        assert_eq!(s.waiting.load(Ordering::Relaxed), 4);
    }

    // Let the rest go.
    s.mutex.lock();
    s.permits.fetch_add(4, Ordering::Relaxed);
    s.condvar.signal_all();
    s.mutex.unlock();
    for w in waiters {
        w.join().unwrap();
    }
    assert_eq!(s.woken.load(Ordering::Relaxed), 5);
}

#[test]
fn test_signal_all_wakes_everyone() {
    let s = shared();
    let waiters = spawn_waiters(s, 5);
    wait_until_waiting(s, 5);

    s.mutex.lock();
    s.permits.fetch_add(5, Ordering::Relaxed);
    s.condvar.signal_all();
    s.mutex.unlock();

    for w in waiters {
        w.join().unwrap();
    }
    assert_eq!(s.woken.load(Ordering::Relaxed), 5);
    assert_eq!(s.waiting.load(Ordering::Relaxed), 0);
}

#[test]
fn test_wait_times_out_holding_the_mutex() {
    let s = shared();
    s.mutex.lock();
    let timed_out = s.condvar.wait_with_timeout(&s.mutex, Duration::from_millis(20));
    assert!(timed_out);
    s.mutex.assert_held();
    s.mutex.unlock();
}

#[test]
fn test_transferred_waiter_wakes_after_release() {
    let s = shared();
    let waiter = spawn_waiters(s, 1);
    wait_until_waiting(s, 1);

    s.mutex.lock();
    s.permits.fetch_add(1, Ordering::Relaxed);
    s.condvar.signal();
    // The waiter now waits for the mutex rather than running.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(s.woken.load(Ordering::Relaxed), 0);
    s.mutex.unlock();

    for w in waiter {
        w.join().unwrap();
    }
    assert_eq!(s.woken.load(Ordering::Relaxed), 1);
}
