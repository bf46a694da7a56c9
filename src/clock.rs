//! Time source for every wait in the relay.
//!
//! The handshake retries, reaction delay and sampling interval all sleep
//! through a [`Clock`] so the pipeline can run against simulated time.

use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::time::Duration;

/// Wall-clock time plus the ability to wait.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    fn sleep(&self, duration: Duration);
}

/// Real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Simulated time: `sleep` advances the clock instead of blocking.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
    slept: Cell<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(start),
            slept: Cell::new(Duration::ZERO),
        }
    }

    /// Move time forward without counting it as a sleep.
    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + to_chrono(duration));
    }

    /// Total time spent in `sleep`.
    pub fn total_slept(&self) -> Duration {
        self.slept.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.set(self.slept.get() + duration);
        self.advance(duration);
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Seconds between two instants as a float, negative if `to` is earlier.
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
