// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Runs as its own process, since it changes the process-wide detection mode.

use std::thread;

use lockweave::sync::{Mutex, OnDeadlockCycle, reported_cycles, set_deadlock_detection_mode};
use lockweave_platform_linux_userland::LinuxUserland;

/// Lock `first`, then `second`, on a fresh thread.
fn lock_in_order(first: &'static Mutex<LinuxUserland>, second: &'static Mutex<LinuxUserland>) {
    thread::spawn(move || {
        first.lock();
        second.lock();
        second.unlock();
        first.unlock();
    })
    .join()
    .unwrap();
}

#[test]
fn test_inverted_order_is_reported_once() {
    set_deadlock_detection_mode(OnDeadlockCycle::Report);
    let platform = LinuxUserland::new();
    let x: &'static Mutex<LinuxUserland> = Box::leak(Box::new(Mutex::new(platform)));
    let y: &'static Mutex<LinuxUserland> = Box::leak(Box::new(Mutex::new(platform)));
    let before = reported_cycles();

    // Spawn thread holding X, then taking Y
    lock_in_order(x, y);
    assert_eq!(reported_cycles(), before);

    // Spawn thread holding Y, then taking X; report mode logs the cycle and carries on
    lock_in_order(y, x);
    assert_eq!(reported_cycles(), before + 1);

    // The original order is still fine
    lock_in_order(x, y);
    assert_eq!(reported_cycles(), before + 1);
}
