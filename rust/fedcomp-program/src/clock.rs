use chrono::Utc;

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Gets the current time in seconds since the epoch.
    fn now(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
/// The system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}
