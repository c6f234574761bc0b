// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::Arc;
use std::sync::Barrier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lockweave::sync::{Condition, Mutex};
use lockweave_platform_linux_userland::LinuxUserland;

/// A counter that is only ever touched with `mutex` held.
struct Counter {
    mutex: Mutex<LinuxUserland>,
    value: AtomicUsize,
}

#[test]
fn test_counter_under_contention() {
    let counter = Arc::new(Counter {
        mutex: Mutex::new(LinuxUserland::new()),
        value: AtomicUsize::new(0),
    });

    let threads: Vec<_> = (0..100)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = counter.mutex.guard();
                    let v = counter.value.load(Ordering::Relaxed);
                    counter.value.store(v + 1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(counter.value.load(Ordering::Relaxed), 100_000);
    // Everyone left; the lock is free again.
    assert!(counter.mutex.try_lock());
    counter.mutex.unlock();
}

#[test]
fn test_readers_exclude_writers_until_all_leave() {
    let mutex = Arc::new(Mutex::new(LinuxUserland::new()));
    let barrier = Arc::new(Barrier::new(4));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                mutex.reader_lock();
                barrier.wait();
                // All readers hold the lock at once.
                barrier.wait();
                mutex.reader_unlock();
            })
        })
        .collect();

    barrier.wait();
    assert!(!mutex.try_lock());
    assert!(mutex.reader_try_lock());
    mutex.reader_unlock();
    barrier.wait();
    for r in readers {
        r.join().unwrap();
    }

    mutex.lock();
    assert!(!mutex.reader_try_lock());
    mutex.unlock();
}

#[test]
fn test_await_condition_times_out() {
    let mutex = Mutex::new(LinuxUserland::new());
    let never = || false;

    mutex.lock();
    let start = Instant::now();
    let satisfied = mutex.await_condition_with_timeout(&Condition::new(&never), Duration::from_millis(50));
    let elapsed = start.elapsed();
    mutex.assert_held();
    mutex.unlock();

    assert!(!satisfied);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(70), "took {elapsed:?}");
}

#[test]
fn test_lock_when_wakes_on_the_releasing_write() {
    let mutex: &'static Mutex<LinuxUserland> = Box::leak(Box::new(Mutex::new(LinuxUserland::new())));
    let value: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));

    let waiter = thread::spawn(move || {
        let reached = || value.load(Ordering::Relaxed) >= 10;
        mutex.lock_when(&Condition::new(&reached));
        let seen = value.load(Ordering::Relaxed);
        mutex.unlock();
        seen
    });

    for _ in 0..10 {
        let _guard = mutex.guard();
        value.fetch_add(1, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(waiter.join().unwrap(), 10);
}
