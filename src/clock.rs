use chrono::{DateTime, Utc};

/// Source of "now" for jobs and caches
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::*;
    use parking_lot::Mutex;

    /// Clock that only moves when told to
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(now: DateTime<Utc>) -> Self {
            Self { now: Mutex::new(now) }
        }

        pub fn advance(&self, by: chrono::Duration) {
            let mut now = self.now.lock();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}
