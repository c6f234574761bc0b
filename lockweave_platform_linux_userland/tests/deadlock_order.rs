// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Runs as its own process, since it changes the process-wide detection mode.

use std::sync::Arc;
use std::thread;

use lockweave::sync::{Mutex, OnDeadlockCycle, reported_cycles, set_deadlock_detection_mode};
use lockweave_platform_linux_userland::LinuxUserland;

#[test]
fn test_consistent_order_is_never_reported() {
    set_deadlock_detection_mode(OnDeadlockCycle::Report);
    let platform = LinuxUserland::new();
    let locks = Arc::new([Mutex::new(platform), Mutex::new(platform), Mutex::new(platform)]);

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                for i in 0..200 {
                    // Any subset, always in the same order.
                    let first = (t + i) % 2;
                    let a = locks[first].guard();
                    let _b = locks[2].reader_guard();
                    drop(a);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let [a, b, c] = &*locks;
    a.lock();
    b.lock();
    c.lock();
    c.unlock();
    b.unlock();
    a.unlock();

    assert_eq!(reported_cycles(), 0);
}
