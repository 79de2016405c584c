use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_DISABLE_THRESHOLD: u32 = 3;

/// Static description of one API credential and its advertised quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSpec {
    pub key: String,
    /// Requests permitted per quota window. Counts attempts, not successes.
    pub quota_limit: u32,
    pub window: Duration,
}

/// Lifecycle state of a pooled credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Active,
    Exhausted,
    Disabled,
}

/// Error returned when no credential has remaining quota.
#[derive(Debug)]
pub struct PoolExhaustedError;

impl std::fmt::Display for PoolExhaustedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "credential pool exhausted: no active credential with remaining quota")
    }
}

impl std::error::Error for PoolExhaustedError {}

/// Point-in-time view of one credential, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSnapshot {
    pub key: String,
    pub status: CredentialStatus,
    pub used_count: u32,
}

#[derive(Debug)]
struct CredentialState {
    key: String,
    quota_limit: u32,
    window: Duration,
    used_count: u32,
    window_started_at: Instant,
    status: CredentialStatus,
    consecutive_failures: u32,
}

impl CredentialState {
    fn roll_window(&mut self, now: Instant) {
        if now.duration_since(self.window_started_at) >= self.window {
            self.used_count = 0;
            self.window_started_at = now;
            if self.status == CredentialStatus::Exhausted {
                self.status = CredentialStatus::Active;
            }
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    credentials: Vec<CredentialState>,
    cursor: usize,
}

/// Rotating pool of API credentials with per-credential quota windows.
///
/// `acquire` is a single atomic unit under one pool-wide lock: it rolls
/// stale windows, skips exhausted or disabled entries, and charges the
/// chosen credential before releasing the lock, so two concurrent workers
/// can never observe remaining quota and both consume the last slot.
#[derive(Debug)]
pub struct CredentialPool {
    inner: Mutex<PoolInner>,
    disable_threshold: u32,
}

impl CredentialPool {
    pub fn new(specs: Vec<CredentialSpec>) -> Self {
        Self::with_disable_threshold(specs, DEFAULT_DISABLE_THRESHOLD)
    }

    pub fn with_disable_threshold(specs: Vec<CredentialSpec>, disable_threshold: u32) -> Self {
        let now = Instant::now();
        let credentials = specs
            .into_iter()
            .map(|spec| CredentialState {
                key: spec.key,
                quota_limit: spec.quota_limit,
                window: spec.window,
                used_count: 0,
                window_started_at: now,
                status: CredentialStatus::Active,
                consecutive_failures: 0,
            })
            .collect();

        Self {
            inner: Mutex::new(PoolInner {
                credentials,
                cursor: 0,
            }),
            disable_threshold: disable_threshold.max(1),
        }
    }

    /// Picks the next usable credential round-robin and charges one quota
    /// slot against it.
    pub fn acquire(&self) -> Result<String, PoolExhaustedError> {
        let mut inner = self.inner.lock().expect("credential pool mutex poisoned");
        let len = inner.credentials.len();
        if len == 0 {
            return Err(PoolExhaustedError);
        }

        let now = Instant::now();
        let start = inner.cursor;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let credential = &mut inner.credentials[idx];
            if credential.status == CredentialStatus::Disabled {
                continue;
            }

            credential.roll_window(now);
            if credential.status != CredentialStatus::Active {
                continue;
            }
            if credential.used_count >= credential.quota_limit {
                credential.status = CredentialStatus::Exhausted;
                continue;
            }

            credential.used_count += 1;
            if credential.used_count >= credential.quota_limit {
                credential.status = CredentialStatus::Exhausted;
                tracing::debug!(key = %credential.key, "credential quota exhausted for this window");
            }
            let key = credential.key.clone();
            inner.cursor = (idx + 1) % len;
            return Ok(key);
        }

        Err(PoolExhaustedError)
    }

    /// Reports the outcome of a request made with `key`.
    ///
    /// Quota is charged at acquire time and never refunded; this call only
    /// tracks credential health. Repeated credential-attributable failures
    /// disable the entry until an operator replaces it.
    pub fn release(&self, key: &str, success: bool) {
        let mut inner = self.inner.lock().expect("credential pool mutex poisoned");
        let Some(credential) = inner.credentials.iter_mut().find(|c| c.key == key) else {
            return;
        };

        if success {
            credential.consecutive_failures = 0;
            return;
        }

        credential.consecutive_failures += 1;
        if credential.consecutive_failures >= self.disable_threshold
            && credential.status != CredentialStatus::Disabled
        {
            credential.status = CredentialStatus::Disabled;
            tracing::warn!(
                key = %credential.key,
                failures = credential.consecutive_failures,
                "credential disabled after repeated failures"
            );
        }
    }

    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let inner = self.inner.lock().expect("credential pool mutex poisoned");
        inner
            .credentials
            .iter()
            .map(|c| CredentialSnapshot {
                key: c.key.clone(),
                status: c.status,
                used_count: c.used_count,
            })
            .collect()
    }
}
