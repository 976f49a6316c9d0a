//! Time units used by the latency and scheduling machinery.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// Microseconds per second.
pub const USEC_PER_SEC: u64 = 1_000_000;
/// Microseconds per millisecond.
pub const USEC_PER_MSEC: u64 = 1_000;

/// The absolute minimum latency a device may be asked for.
pub const MIN_LATENCY: MicroSeconds = MicroSeconds(500);
/// The absolute maximum latency a device may be asked for.
pub const MAX_LATENCY: MicroSeconds = MicroSeconds(10 * USEC_PER_SEC);
/// The latency reported by devices without dynamic latency support.
pub const DEFAULT_FIXED_LATENCY: MicroSeconds = MicroSeconds(250 * USEC_PER_MSEC);

/// A duration or timestamp in microseconds.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MicroSeconds(pub u64);

impl MicroSeconds {
    /// Clamps `self` into the valid latency range.
    pub fn clamp_latency(self) -> MicroSeconds {
        MicroSeconds(self.0.clamp(MIN_LATENCY.0, MAX_LATENCY.0))
    }

    /// Saturating subtraction.
    pub fn saturating_sub(self, rhs: MicroSeconds) -> MicroSeconds {
        MicroSeconds(self.0.saturating_sub(rhs.0))
    }
}

impl Add for MicroSeconds {
    type Output = MicroSeconds;

    fn add(self, rhs: MicroSeconds) -> MicroSeconds {
        MicroSeconds(self.0 + rhs.0)
    }
}

impl AddAssign for MicroSeconds {
    fn add_assign(&mut self, rhs: MicroSeconds) {
        self.0 += rhs.0;
    }
}

impl Sub for MicroSeconds {
    type Output = MicroSeconds;

    fn sub(self, rhs: MicroSeconds) -> MicroSeconds {
        MicroSeconds(self.0 - rhs.0)
    }
}

impl From<Duration> for MicroSeconds {
    fn from(d: Duration) -> Self {
        MicroSeconds(d.as_micros() as u64)
    }
}

impl fmt::Display for MicroSeconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} us", self.0)
    }
}
