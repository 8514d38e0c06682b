// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Clock interface and implementations for testability.

use std::sync::Arc;
use std::time::Duration;

use crate::Mutex;
use tracing::warn;

/// Abstract interface to the system monotonic clock. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current time from `CLOCK_MONOTONIC`, in microseconds.
    ///
    /// Every presentation timestamp in the pipeline is stamped from this
    /// clock; streams are only comparable against each other, never against
    /// wall-clock time.
    fn monotonic_us(&self) -> u64;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl Clocks for RealClocks {
    fn monotonic_us(&self) -> u64 {
        // clock_gettime(CLOCK_MONOTONIC) can't fail on any supported target;
        // main performs a startup check before anything is logged.
        let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .expect("CLOCK_MONOTONIC is available");
        ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long);
    }
}

/// Logs a warning if the TimerGuard lives "too long", using the label created
/// by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start_us: u64,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start_us: clocks.monotonic_us(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed_us = self.clocks.monotonic_us().saturating_sub(self.start_us);
        if elapsed_us >= 1_000_000 {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {} ms!", label_f().as_ref(), elapsed_us / 1_000);
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    uptime_us: Mutex<u64>,
}

impl SimulatedClocks {
    pub fn new() -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            uptime_us: Mutex::new(0),
        }))
    }
}

impl Default for SimulatedClocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocks for SimulatedClocks {
    fn monotonic_us(&self) -> u64 {
        *self.0.uptime_us.lock()
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime_us.lock();
        *l += how_long.as_micros() as u64;
    }
}
