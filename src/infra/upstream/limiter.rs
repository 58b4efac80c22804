//! Fixed-interval pacing for upstream requests.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Serializes request issuance so consecutive upstream attempts are spaced at
/// least `min_interval` apart, process-wide for whichever components share the
/// instance. Injected everywhere it is needed; there is no global.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_issued: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_issued: Mutex::new(None),
        }
    }

    /// Wait until a request slot is available and claim it. Concurrent
    /// callers queue on the internal mutex, so each released caller observes
    /// the previous caller's issue time.
    pub async fn acquire(&self) {
        let mut last = self.last_issued.lock().await;
        let now = Instant::now();
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > now {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
