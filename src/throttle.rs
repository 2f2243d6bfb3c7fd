use std::time::Duration;

use tokio::time::Instant;

/// Drops requests arriving closer than `min_interval` to the last admitted one.
/// Dropped requests are not queued: a newer position will supersede them anyway.
#[derive(Debug, Clone)]
pub struct ThrottleWindow {
    last_request_at: Option<Instant>,
    min_interval: Duration,
}

impl ThrottleWindow {
    pub fn new(min_interval: Duration) -> ThrottleWindow {
        ThrottleWindow {
            last_request_at: None,
            min_interval,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Admits the request and records `now` if the window has elapsed.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        match self.last_request_at {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_request_at = Some(now);
                true
            }
        }
    }
}
