use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Exponential reconnect delay: doubles from the initial value up to a cap,
/// reset after a session authenticates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl ReconnectBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.next = self.initial;
    }

    /// Returns the delay for the upcoming attempt and advances the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let current = self.next;
        let doubled = if current.is_zero() {
            self.max.min(Duration::from_millis(1))
        } else {
            current.saturating_mul(2)
        };
        self.next = doubled.min(self.max);
        current
    }
}

/// Sleeps unless the token is cancelled first. Returns false on cancellation.
pub(crate) async fn sleep_with_cancellation(delay: Duration, token: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !token.is_cancelled();
    }

    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
