// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Conditions for conditional critical sections ([`Mutex::lock_when`](super::Mutex::lock_when),
//! [`Mutex::await_condition`](super::Mutex::await_condition), and friends).

use core::sync::atomic::{AtomicBool, Ordering};

/// A predicate over state protected by a [`Mutex`](super::Mutex).
///
/// A condition is evaluated only while the mutex is held, either by the waiting thread or by a
/// thread releasing the mutex on the waiter's behalf. It must therefore be cheap, must not block,
/// and must not itself operate on any lockweave mutex.
#[derive(Clone, Copy)]
pub struct Condition<'a> {
    kind: Kind<'a>,
}

#[derive(Clone, Copy)]
enum Kind<'a> {
    Always,
    Predicate(&'a (dyn Fn() -> bool + Sync)),
    Flag(&'a AtomicBool),
}

impl Condition<'static> {
    /// A condition that always holds.
    pub const TRUE: Condition<'static> = Condition { kind: Kind::Always };
}

impl<'a> Condition<'a> {
    /// A condition that holds whenever `predicate` returns true.
    pub fn new(predicate: &'a (dyn Fn() -> bool + Sync)) -> Self {
        Self {
            kind: Kind::Predicate(predicate),
        }
    }

    /// A condition that holds whenever `flag` is set.
    pub fn from_flag(flag: &'a AtomicBool) -> Self {
        Self {
            kind: Kind::Flag(flag),
        }
    }

    /// Evaluate the condition.
    pub fn eval(&self) -> bool {
        match self.kind {
            Kind::Always => true,
            Kind::Predicate(predicate) => predicate(),
            Kind::Flag(flag) => flag.load(Ordering::Acquire),
        }
    }

    /// Whether `a` and `b` are guaranteed to evaluate the same way. A missing condition is
    /// equivalent to [`Condition::TRUE`].
    ///
    /// False negatives are allowed: two distinct closures that happen to compute the same thing
    /// are not considered equal.
    #[allow(ambiguous_wide_pointer_comparisons)]
    pub fn guaranteed_equal(a: Option<&Condition<'_>>, b: Option<&Condition<'_>>) -> bool {
        let a = a.map_or(Kind::Always, |c| c.kind);
        let b = b.map_or(Kind::Always, |c| c.kind);
        match (a, b) {
            (Kind::Always, Kind::Always) => true,
            // Both data and vtable must match: distinct zero-sized closures share an address.
            (Kind::Predicate(x), Kind::Predicate(y)) => core::ptr::eq(x, y),
            (Kind::Flag(x), Kind::Flag(y)) => core::ptr::eq(x, y),
            _ => false,
        }
    }
}

impl core::fmt::Debug for Condition<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind {
            Kind::Always => f.write_str("Condition::TRUE"),
            Kind::Predicate(p) => write!(f, "Condition({:p})", p),
            Kind::Flag(flag) => write!(f, "Condition(flag@{:p})", flag),
        }
    }
}
