use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Time source for a [`super::WheelTimer`].
///
/// Deadlines are computed from `now_nanos`, which must never go backwards.
/// A database-synchronized clock plugs in here by implementing both methods
/// against its own offset.
pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary, fixed origin.
    fn now_nanos(&self) -> u64;

    /// Wall-clock time, used to turn absolute fire times into delays.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// `Instant`-backed clock; the default.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// How the worker turns "time left until the next tick" into a sleep.
///
/// Whatever the strategy, the worker re-reads the clock after waking and
/// sleeps again if the tick boundary has not been reached, so a tick is
/// never processed early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepRounding {
    /// Round up to whole milliseconds.
    Exact,
    /// Round down to a multiple of `granularity` (at least 1 ms), for
    /// platforms whose sleep resolution is coarse and tends to oversleep.
    Coarse { granularity: Duration },
}

impl SleepRounding {
    /// `Coarse` at 10 ms on Windows, `Exact` elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            SleepRounding::Coarse {
                granularity: Duration::from_millis(10),
            }
        } else {
            SleepRounding::Exact
        }
    }

    pub fn coarsen(&self, remaining: Duration) -> Duration {
        match self {
            SleepRounding::Exact => {
                let ms = remaining.as_nanos().div_ceil(1_000_000);
                Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX))
            }
            SleepRounding::Coarse { granularity } => {
                let step = granularity.as_millis().max(1);
                let ms = (remaining.as_millis() / step * step).max(1);
                Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX))
            }
        }
    }
}

impl Default for SleepRounding {
    fn default() -> Self {
        Self::platform_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_rounding_never_shortens_the_wait() {
        let r = SleepRounding::Exact;
        assert_eq!(r.coarsen(Duration::from_nanos(1)), Duration::from_millis(1));
        assert_eq!(r.coarsen(Duration::from_micros(1500)), Duration::from_millis(2));
        assert_eq!(r.coarsen(Duration::from_millis(2)), Duration::from_millis(2));
    }

    #[test]
    fn coarse_rounding_snaps_down_with_a_floor() {
        let r = SleepRounding::Coarse {
            granularity: Duration::from_millis(10),
        };
        assert_eq!(r.coarsen(Duration::from_millis(25)), Duration::from_millis(20));
        assert_eq!(r.coarsen(Duration::from_millis(3)), Duration::from_millis(1));
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b >= a);
    }
}
