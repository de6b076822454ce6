//! Sources of "now" for recalculation passes.

use chrono::{DateTime, Duration, Local, TimeZone};
use std::sync::{Mutex, PoisonError};

pub trait Clock: Send + Sync {
    type Tz: TimeZone;

    fn now(&self) -> DateTime<Self::Tz>;
}

/// Wall clock in the system's local time zone
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Tz = Local;

    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock pinned to a given instant until moved explicitly
#[derive(Debug)]
pub struct FixedClock<Tz: TimeZone> {
    now: Mutex<DateTime<Tz>>,
}

impl<Tz: TimeZone> FixedClock<Tz> {
    pub fn new(now: DateTime<Tz>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Tz>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.clone() + by;
    }
}

impl<Tz> Clock for FixedClock<Tz>
where
    Tz: TimeZone + Send + Sync,
    Tz::Offset: Send,
{
    type Tz = Tz;

    fn now(&self) -> DateTime<Tz> {
        self.now
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_fixed_clock_moves_only_when_told() {
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), start + Duration::minutes(90));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
