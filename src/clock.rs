use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall clock and sleeper used by the sync worker.
#[cfg_attr(test, mockall::automock)]
pub trait Clock {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    fn sleep(&self, duration: Duration);
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        // A clock set before 1970 reads as negative rather than failing.
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        }
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
