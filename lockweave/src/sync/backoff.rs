// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bounded back-off for retry loops inside the mutex engine.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use crate::platform::SchedulerProvider;

/// How eagerly a retry loop spins before handing the CPU back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DelayMode {
    /// Spin for longer; used where nobody else can make progress until we do.
    Aggressive,
    /// Spin briefly; used for ordinary waits.
    Gentle,
}

static MUTEX_SLEEP_NANOS: AtomicU64 = AtomicU64::new(10_000);

/// Set how long a retry loop sleeps once it has exhausted its spins and its yield.
pub fn set_mutex_sleep_time(duration: Duration) {
    MUTEX_SLEEP_NANOS.store(
        u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
        Ordering::Relaxed,
    );
}

/// Number of CPUs, or zero until first asked.
static CPUS: AtomicUsize = AtomicUsize::new(0);

fn cpus<Platform: SchedulerProvider>(platform: &Platform) -> usize {
    let n = CPUS.load(Ordering::Relaxed);
    if n != 0 {
        return n;
    }
    let n = platform.available_parallelism().max(1);
    CPUS.store(n, Ordering::Relaxed);
    n
}

/// Iterations a writer spins on the lock word before entering the slow path.
pub(crate) fn spinloop_iterations<Platform: SchedulerProvider>(platform: &Platform) -> u32 {
    if cpus(platform) > 1 { 1500 } else { 0 }
}

fn spin_limit<Platform: SchedulerProvider>(platform: &Platform, mode: DelayMode) -> u32 {
    if cpus(platform) <= 1 {
        return 0;
    }
    match mode {
        DelayMode::Aggressive => 5000,
        DelayMode::Gentle => 250,
    }
}

/// One step of back-off. `c` is the step count returned by the previous call (start with 0).
///
/// Spins up to a mode-dependent limit, then yields once, then sleeps and starts over.
pub(crate) fn delay<Platform: SchedulerProvider>(
    platform: &Platform,
    c: u32,
    mode: DelayMode,
) -> u32 {
    let limit = spin_limit(platform, mode);
    if c < limit {
        core::hint::spin_loop();
        c + 1
    } else if c == limit {
        platform.yield_now();
        c + 1
    } else {
        platform.sleep(Duration::from_nanos(
            MUTEX_SLEEP_NANOS.load(Ordering::Relaxed),
        ));
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;

    #[test]
    fn spins_then_yields_then_sleeps() {
        let platform = MockPlatform::new();
        let limit = spin_limit(platform, DelayMode::Gentle);
        let mut c = 0;
        for expected in 1..=limit {
            c = delay(platform, c, DelayMode::Gentle);
            assert_eq!(c, expected);
        }
        c = delay(platform, c, DelayMode::Gentle);
        assert_eq!(c, limit + 1);
        assert_eq!(delay(platform, c, DelayMode::Gentle), 0);
        assert!(spin_limit(platform, DelayMode::Aggressive) >= limit);
    }
}
