use chrono::{DateTime, Utc};

/// Source of the current time for drivers, processor, reaper and scheduler
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

pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Clock that only moves when told to
    #[derive(Debug)]
    pub struct MockClock {
        current_time: Mutex<DateTime<Utc>>,
    }

    impl MockClock {
        pub fn new(initial_time: DateTime<Utc>) -> Self {
            Self {
                current_time: Mutex::new(initial_time),
            }
        }

        pub fn set_time(&self, time: DateTime<Utc>) {
            *self.current_time.lock().unwrap_or_else(|e| e.into_inner()) = time;
        }

        pub fn advance(&self, duration: chrono::Duration) {
            let mut time = self.current_time.lock().unwrap_or_else(|e| e.into_inner());
            *time += duration;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.current_time.lock().unwrap_or_else(|e| e.into_inner())
        }
    }
}
