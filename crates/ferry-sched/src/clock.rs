//! Scheduler clock.

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

/// Wall-clock time advanced by the tokio clock.
///
/// Timestamps written to the store and compared against retry delays come
/// from one source, so delays measured in stored timestamps agree with
/// `tokio::time::sleep`, paused test clocks included.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            base: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.origin.elapsed()).unwrap_or(Duration::zero());
        self.base + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_follows_tokio_time() {
        let clock = Clock::new();
        let before = clock.now();
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        assert_eq!(clock.now() - before, Duration::seconds(90));
    }
}
