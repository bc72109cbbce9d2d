//! Wall-clock abstraction
//!
//! Status timestamps, TTLs and log file periods are taken from a [`Clock`]
//! so tests can pin time.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(2));
        assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 2, 1, 0, 1, 0).unwrap());
    }

    #[test]
    fn clones_share_time() {
        let clock = ManualClock::new(Utc::now());
        let other = clock.clone();
        let target = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();
        other.set(target);
        assert_eq!(clock.now(), target);
    }
}
