use chrono::{DateTime, Utc};
use std::time::Duration;

/// Source of wall-clock time and blocking sleeps.
///
/// Everything that throttles, backs off or compares against a TTL goes
/// through this so the timing rules can be exercised without real sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Elapsed time between two instants, clamped at zero when `later` is
/// actually earlier.
pub fn elapsed(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
