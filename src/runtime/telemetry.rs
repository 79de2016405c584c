use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    commands_received: AtomicU64,
    commands_dispatched: AtomicU64,
    handler_failures: AtomicU64,
    acks_sent: AtomicU64,
    reconnects: AtomicU64,
}

impl Telemetry {
    pub fn record_command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commands_received(&self) -> u64 {
        self.commands_received.load(Ordering::Relaxed)
    }

    pub fn acks_sent(&self) -> u64 {
        self.acks_sent.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            commands_received: self.commands_received.load(Ordering::Relaxed),
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub commands_received: u64,
    pub commands_dispatched: u64,
    pub handler_failures: u64,
    pub acks_sent: u64,
    pub reconnects: u64,
}

/// Spawns a background task that periodically logs command throughput,
/// failures, and reconnect counts.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "outpost::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let dispatched_delta = current_snapshot
                        .commands_dispatched
                        .saturating_sub(last_snapshot.commands_dispatched);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        dispatched_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "outpost::metrics",
                        throughput = format!("{throughput:.2}"),
                        commands_received = current_snapshot.commands_received,
                        commands_dispatched = current_snapshot.commands_dispatched,
                        handler_failures = current_snapshot.handler_failures,
                        acks_sent = current_snapshot.acks_sent,
                        reconnects = current_snapshot.reconnects,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn telemetry_records_counters() {
        let telemetry = Telemetry::default();
        telemetry.record_command_received();
        telemetry.record_command_received();
        telemetry.record_command_dispatched();
        telemetry.record_handler_failure();
        telemetry.record_ack_sent();
        telemetry.record_reconnect();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.commands_received, 2);
        assert_eq!(snapshot.commands_dispatched, 1);
        assert_eq!(snapshot.handler_failures, 1);
        assert_eq!(snapshot.acks_sent, 1);
        assert_eq!(snapshot.reconnects, 1);
    }

    #[tokio::test]
    async fn metrics_reporter_logs_until_shutdown() {
        let telemetry = Arc::new(Telemetry::default());
        telemetry.record_command_dispatched();

        let shutdown = CancellationToken::new();
        let handle =
            spawn_metrics_reporter(telemetry, shutdown.clone(), Duration::from_millis(10));

        shutdown.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop promptly")
            .expect("task should not panic");
    }
}
