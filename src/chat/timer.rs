/// Restartable countdown, polled by the reactor.
///
/// Nothing runs in the background: the caller arms the timer and later asks
/// whether it has expired. Uses tokio's clock so paused-time tests can drive it.
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Timer {
    timeout: Duration,
    armed: Option<(Instant, Duration)>,
}

impl Timer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            armed: None,
        }
    }

    /// Arm the timer from now. `timeout` overrides the configured duration
    /// for this run only.
    pub fn start(&mut self, timeout: Option<Duration>) {
        self.armed = Some((Instant::now(), timeout.unwrap_or(self.timeout)));
    }

    pub fn reset(&mut self) {
        self.armed = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn has_expired(&self) -> bool {
        match self.armed {
            Some((since, timeout)) => since.elapsed() >= timeout,
            None => false,
        }
    }

    /// Time left before expiry; `None` while disarmed.
    pub fn remaining(&self) -> Option<Duration> {
        self.armed
            .map(|(since, timeout)| timeout.saturating_sub(since.elapsed()))
    }
}
