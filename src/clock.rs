use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

/// key: engine-clock -> injected "now"
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    instant: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            instant: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        let mut guard = self
            .instant
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self
            .instant
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = *guard + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .instant
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_shares_instant_between_clones() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();
        clock.advance(Duration::minutes(90));
        assert_eq!(other.now(), start + Duration::minutes(90));
    }
}
