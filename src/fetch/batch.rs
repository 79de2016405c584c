use crate::fetch::client::{FetchError, TargetFetch};
use crate::fetch::credentials::CredentialPool;
use crate::fetch::limiter::RateLimiter;
use crate::fetch::metrics::{FetchMetrics, FetchMetricsSnapshot};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default cap on concurrent in-flight requests per batch.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Outcome for exactly one target of a batch.
#[derive(Debug)]
pub struct FetchResult {
    pub target: String,
    /// Credential charged for the attempt, when one was acquired.
    pub credential: Option<String>,
    pub outcome: Result<Value, FetchError>,
}

/// Runs batches of target fetches through a bounded worker pool, arbitrating
/// the shared credential pool and rate limiter.
pub struct Fetcher {
    api: Arc<dyn TargetFetch>,
    pool: Arc<CredentialPool>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<FetchMetrics>,
    max_concurrency: usize,
}

impl Fetcher {
    pub fn new(
        api: Arc<dyn TargetFetch>,
        pool: Arc<CredentialPool>,
        limiter: Arc<RateLimiter>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            api,
            pool,
            limiter,
            metrics: Arc::new(FetchMetrics::default()),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn metrics_snapshot(&self) -> FetchMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Fetches every target, never spawning more workers than targets.
    ///
    /// Returns exactly one result per input target, in input order. A failed
    /// target never cancels its siblings; the caller decides what a partial
    /// batch means.
    pub async fn fetch_batch(&self, targets: &[String]) -> Vec<FetchResult> {
        if targets.is_empty() {
            return Vec::new();
        }

        let targets: Arc<Vec<String>> = Arc::new(targets.to_vec());
        let worker_count = self.max_concurrency.min(targets.len());
        let cursor = Arc::new(AtomicUsize::new(0));
        let (results_tx, mut results_rx) = mpsc::channel::<(usize, FetchResult)>(targets.len());

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let targets = targets.clone();
            let cursor = cursor.clone();
            let results_tx = results_tx.clone();
            let api = self.api.clone();
            let pool = self.pool.clone();
            let limiter = self.limiter.clone();
            let metrics = self.metrics.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    if idx >= targets.len() {
                        break;
                    }
                    let result =
                        fetch_one(api.as_ref(), &pool, &limiter, &metrics, &targets[idx]).await;
                    if results_tx.send((idx, result)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(results_tx);

        let mut slots: Vec<Option<FetchResult>> = (0..targets.len()).map(|_| None).collect();
        while let Some((idx, result)) = results_rx.recv().await {
            slots[idx] = Some(result);
        }

        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "fetch worker task panicked");
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| FetchResult {
                    target: targets[idx].clone(),
                    credential: None,
                    outcome: Err(FetchError::Transport {
                        detail: "fetch worker exited before producing a result".to_string(),
                    }),
                })
            })
            .collect()
    }
}

async fn fetch_one(
    api: &dyn TargetFetch,
    pool: &CredentialPool,
    limiter: &RateLimiter,
    metrics: &FetchMetrics,
    target: &str,
) -> FetchResult {
    let credential = match pool.acquire() {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!(target, error = %err, "skipping target");
            return FetchResult {
                target: target.to_string(),
                credential: None,
                outcome: Err(FetchError::PoolExhausted),
            };
        }
    };

    limiter.acquire_slot(&credential).await;

    let started = std::time::Instant::now();
    let outcome = api.fetch(target, &credential).await;
    let elapsed = started.elapsed();

    match &outcome {
        Ok(_) => {
            metrics.record_success(elapsed);
            pool.release(&credential, true);
        }
        Err(err) => {
            match err {
                FetchError::Timeout => metrics.record_timeout(elapsed),
                FetchError::RateLimited => metrics.record_rate_limited(elapsed),
                _ => metrics.record_failure(elapsed),
            }
            pool.release(&credential, !err.is_credential_fault());
            tracing::debug!(target, error = %err, "target fetch failed");
        }
    }

    FetchResult {
        target: target.to_string(),
        credential: Some(credential),
        outcome,
    }
}
