//! Monotonic time seam and value-typed deadlines.
//!
//! The driver never blocks on time: every timeout is a [`Deadline`] polled
//! from the tick. The [`Clock`] trait exists so desktop tests can drive time
//! by hand (see [`crate::sim::SimClock`]).

use std::time::{Duration, Instant};

/// Source of monotonic "now". One implementation per deployment; the driver
/// asks for the time once per tick and passes it down.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The real monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A single-shot deadline. Disarmed by default; at most one of each kind is
/// armed at any instant (the engine owns one modem deadline and one aux
/// deadline, the API layer one per background timer).
#[derive(Debug, Default, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Arm the deadline `lapse` from `now`, replacing any previous value.
    pub fn arm(&mut self, now: Instant, lapse: Duration) {
        self.0 = Some(now + lapse);
    }

    /// Disarm. A stopped deadline never reports expiry.
    pub fn stop(&mut self) {
        self.0 = None;
    }

    pub fn is_armed(&self) -> bool {
        self.0.is_some()
    }

    /// True once `now` has reached the armed deadline. Stays true until the
    /// deadline is stopped or re-armed.
    pub fn expired(&self, now: Instant) -> bool {
        self.0.is_some_and(|t| now >= t)
    }

    /// Poll-and-clear: reports expiry once, disarming in the same step.
    pub fn take_expired(&mut self, now: Instant) -> bool {
        if self.expired(now) {
            self.0 = None;
            true
        } else {
            false
        }
    }
}
