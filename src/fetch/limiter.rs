use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

const GLOBAL_SLOT: &str = "*";

/// Whether request spacing applies per credential or across the whole API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterScope {
    Global,
    PerCredential,
}

/// Enforces a minimum interval between consecutive requests under one scope.
///
/// Callers reserve a send slot under a short lock: the slot is
/// `max(now, previous slot + interval)`, stored immediately so concurrent
/// callers chain their reservations, then awaited outside the lock. Waiting
/// always suspends; there is no spinning.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    scope: LimiterScope,
    reservations: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, scope: LimiterScope) -> Self {
        Self {
            min_interval,
            scope,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> LimiterScope {
        self.scope
    }

    /// Suspends until the caller may send a request attributed to `key`.
    pub async fn acquire_slot(&self, key: &str) {
        if self.min_interval.is_zero() {
            return;
        }

        let slot_key = match self.scope {
            LimiterScope::Global => GLOBAL_SLOT,
            LimiterScope::PerCredential => key,
        };

        let deadline = {
            let mut reservations = self.reservations.lock().await;
            let now = Instant::now();
            let slot = match reservations.get(slot_key) {
                Some(previous) => (*previous + self.min_interval).max(now),
                None => now,
            };
            reservations.insert(slot_key.to_string(), slot);
            slot
        };

        sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn consecutive_requests_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(200), LimiterScope::Global);
        let started = Instant::now();

        limiter.acquire_slot("key-a").await;
        limiter.acquire_slot("key-a").await;
        limiter.acquire_slot("key-a").await;

        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn per_credential_scope_does_not_cross_keys() {
        let limiter = RateLimiter::new(Duration::from_millis(500), LimiterScope::PerCredential);
        let started = Instant::now();

        limiter.acquire_slot("key-a").await;
        limiter.acquire_slot("key-b").await;

        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_chain_reservations() {
        let limiter = Arc::new(RateLimiter::new(
            Duration::from_millis(100),
            LimiterScope::Global,
        ));
        let started = Instant::now();

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire_slot("key-a").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn zero_interval_is_a_no_op() {
        let limiter = RateLimiter::new(Duration::ZERO, LimiterScope::Global);
        limiter.acquire_slot("key-a").await;
    }
}
