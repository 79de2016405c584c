use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dispatch::registry::{CommandHandler, HandlerFuture};
use crate::dispatch::HandlerReport;
use crate::handlers::quotes::{normalize_stock_code, QUOTES_DOMAIN};
use crate::store::{Record, RecordStore};

/// Store domain holding one row per `(code:alert_type, alert date)`, so a
/// signal fires at most once per day.
pub const SIGNALS_DOMAIN: &str = "stock_signals";

/// Command type served by [`MaCrossHandler`].
pub const COMMAND_RUN_MA_CROSS: &str = "run_ma_cross";

/// Command type served by [`RsiHandler`].
pub const COMMAND_RUN_RSI: &str = "run_rsi";

pub const DEFAULT_FAST_PERIOD: usize = 5;
pub const DEFAULT_SLOW_PERIOD: usize = 20;
pub const DEFAULT_RSI_PERIOD: usize = 14;

/// One triggered signal, handed to the notifier and persisted as a record.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalAlert {
    pub code: String,
    pub name: String,
    pub alert_type: String,
    pub value: f64,
    pub current_price: f64,
}

/// Delivery seam for triggered signals. The agent core only records and
/// dedups; the embedding process decides how operators hear about it.
pub trait SignalNotifier: Send + Sync + 'static {
    fn notify<'a>(&'a self, alert: &'a SignalAlert) -> BoxFuture<'a, Result<()>>;
}

/// Default notifier: one structured log line per alert.
pub struct LogNotifier;

impl SignalNotifier for LogNotifier {
    fn notify<'a>(&'a self, alert: &'a SignalAlert) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tracing::info!(
                code = %alert.code,
                name = %alert.name,
                alert_type = %alert.alert_type,
                value = alert.value,
                current_price = alert.current_price,
                "signal triggered"
            );
            Ok(())
        })
    }
}

#[derive(Debug, Deserialize)]
struct MaCrossPayload {
    items: Vec<MaCrossItem>,
}

#[derive(Debug, Deserialize)]
struct MaCrossItem {
    code: String,
    name: Option<String>,
    fast: Option<usize>,
    slow: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RsiPayload {
    items: Vec<RsiItem>,
}

#[derive(Debug, Deserialize)]
struct RsiItem {
    code: String,
    name: Option<String>,
    period: Option<usize>,
    rsi_high: Option<f64>,
    rsi_low: Option<f64>,
}

/// Moving-average cross monitor over persisted quote history.
///
/// For each item the handler reads the most recent closes from the quote
/// domain, compares the fast and slow moving averages of the previous and
/// current windows, and records a `gold_cross` or `death_cross` signal when
/// the difference changes sign. The signal store's composite key dedups
/// repeat alerts within a day; only a fresh insert reaches the notifier.
pub struct MaCrossHandler {
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn SignalNotifier>,
}

impl MaCrossHandler {
    pub fn new(store: Arc<dyn RecordStore>, notifier: Arc<dyn SignalNotifier>) -> Self {
        Self { store, notifier }
    }

    async fn run(&self, payload: &Value) -> Result<HandlerReport> {
        let payload: MaCrossPayload =
            serde_json::from_value(payload.clone()).context("invalid run_ma_cross payload")?;

        let mut report = HandlerReport::with_requested(payload.items.len() as u64);
        for item in payload.items {
            let code = normalize_stock_code(&item.code);
            let name = item.name.unwrap_or_else(|| code.clone());
            let fast = item.fast.unwrap_or(DEFAULT_FAST_PERIOD);
            let slow = item.slow.unwrap_or(DEFAULT_SLOW_PERIOD);
            if fast == 0 || fast >= slow {
                tracing::warn!(code = %code, fast, slow, "periods must satisfy 0 < fast < slow");
                report.failed += 1;
                continue;
            }

            let closes = match load_close_history(&*self.store, &code, slow + 1).await {
                Ok(closes) => closes,
                Err(err) => {
                    tracing::error!(code = %code, error = %err, "quote history read failed");
                    report.failed += 1;
                    continue;
                }
            };
            let Some(signal) = compute_ma_cross(&closes, fast, slow) else {
                tracing::warn!(
                    code = %code,
                    have = closes.len(),
                    need = slow + 1,
                    "not enough close history for the slow window"
                );
                report.failed += 1;
                continue;
            };

            tracing::debug!(
                code = %code,
                fast_ma = signal.fast_ma,
                slow_ma = signal.slow_ma,
                prev_diff = signal.prev_diff,
                curr_diff = signal.curr_diff,
                cross = signal.cross.unwrap_or("none"),
                "moving averages evaluated"
            );
            if let Some(cross) = signal.cross {
                let alert = SignalAlert {
                    code: code.clone(),
                    name,
                    alert_type: cross.to_string(),
                    value: signal.curr_diff,
                    current_price: *closes.last().unwrap_or(&0.0),
                };
                record_alert(&*self.store, &*self.notifier, &mut report, alert).await;
            }
        }

        Ok(report)
    }
}

impl CommandHandler for MaCrossHandler {
    fn execute<'a>(&'a self, payload: &'a Value) -> HandlerFuture<'a> {
        Box::pin(self.run(payload))
    }
}

/// RSI threshold monitor over persisted quote history.
///
/// Computes the relative strength index from the most recent closes and
/// records an `rsi_high` or `rsi_low` signal when the item's thresholds are
/// crossed. Items without thresholds are evaluated but never alert.
pub struct RsiHandler {
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn SignalNotifier>,
}

impl RsiHandler {
    pub fn new(store: Arc<dyn RecordStore>, notifier: Arc<dyn SignalNotifier>) -> Self {
        Self { store, notifier }
    }

    async fn run(&self, payload: &Value) -> Result<HandlerReport> {
        let payload: RsiPayload =
            serde_json::from_value(payload.clone()).context("invalid run_rsi payload")?;

        let mut report = HandlerReport::with_requested(payload.items.len() as u64);
        for item in payload.items {
            let code = normalize_stock_code(&item.code);
            let name = item.name.unwrap_or_else(|| code.clone());
            let period = item.period.unwrap_or(DEFAULT_RSI_PERIOD);
            if period == 0 {
                tracing::warn!(code = %code, "rsi period must be greater than 0");
                report.failed += 1;
                continue;
            }

            let closes = match load_close_history(&*self.store, &code, period + 1).await {
                Ok(closes) => closes,
                Err(err) => {
                    tracing::error!(code = %code, error = %err, "quote history read failed");
                    report.failed += 1;
                    continue;
                }
            };
            let Some(rsi) = compute_rsi(&closes, period) else {
                tracing::warn!(
                    code = %code,
                    have = closes.len(),
                    need = period + 1,
                    "not enough close history for the rsi window"
                );
                report.failed += 1;
                continue;
            };

            tracing::debug!(code = %code, rsi, "rsi evaluated");
            let alert_type = match (item.rsi_high, item.rsi_low) {
                (Some(high), _) if rsi >= high => Some("rsi_high"),
                (_, Some(low)) if rsi <= low => Some("rsi_low"),
                _ => None,
            };
            if let Some(alert_type) = alert_type {
                let alert = SignalAlert {
                    code: code.clone(),
                    name,
                    alert_type: alert_type.to_string(),
                    value: rsi,
                    current_price: *closes.last().unwrap_or(&0.0),
                };
                record_alert(&*self.store, &*self.notifier, &mut report, alert).await;
            }
        }

        Ok(report)
    }
}

impl CommandHandler for RsiHandler {
    fn execute<'a>(&'a self, payload: &'a Value) -> HandlerFuture<'a> {
        Box::pin(self.run(payload))
    }
}

/// Close prices for the most recent `need` persisted quotes, oldest first.
/// Quotes without a recognizable price field are dropped.
async fn load_close_history(store: &dyn RecordStore, code: &str, need: usize) -> Result<Vec<f64>> {
    let history = store.recent_records(QUOTES_DOMAIN, code, need).await?;
    Ok(history
        .iter()
        .filter_map(|record| close_price(&record.payload))
        .collect())
}

fn close_price(quote: &Value) -> Option<f64> {
    for key in ["close", "price", "last"] {
        if let Some(price) = quote.get(key).and_then(Value::as_f64) {
            return Some(price);
        }
    }
    None
}

/// Persists one alert and notifies on fresh inserts. A skipped write means
/// the same signal already fired today; the notifier stays quiet.
async fn record_alert(
    store: &dyn RecordStore,
    notifier: &dyn SignalNotifier,
    report: &mut HandlerReport,
    alert: SignalAlert,
) {
    let entity_id = format!("{}:{}", alert.code, alert.alert_type);
    let alert_date = Utc::now().format("%Y-%m-%d").to_string();
    let payload = json!({
        "code": alert.code,
        "name": alert.name,
        "alert_type": alert.alert_type,
        "value": alert.value,
        "current_price": alert.current_price,
        "alert_time": Utc::now().to_rfc3339(),
    });
    let record = Record::new(entity_id, alert_date, payload);

    match store.write_if_absent(SIGNALS_DOMAIN, vec![record]).await {
        Ok(outcome) => {
            report.inserted += outcome.inserted;
            report.skipped += outcome.skipped;
            if outcome.inserted > 0 {
                if let Err(err) = notifier.notify(&alert).await {
                    tracing::warn!(
                        code = %alert.code,
                        alert_type = %alert.alert_type,
                        error = %err,
                        "signal notification failed"
                    );
                }
            }
        }
        Err(err) => {
            tracing::error!(code = %alert.code, error = %err, "signal store write failed");
            report.failed += 1;
        }
    }
}

struct MaCrossSignal {
    cross: Option<&'static str>,
    fast_ma: f64,
    slow_ma: f64,
    prev_diff: f64,
    curr_diff: f64,
}

/// Compares the fast/slow moving averages of the window ending at the last
/// close against the window ending one close earlier. Needs `slow + 1`
/// closes; returns `None` with fewer.
fn compute_ma_cross(closes: &[f64], fast: usize, slow: usize) -> Option<MaCrossSignal> {
    if fast == 0 || fast >= slow || closes.len() < slow + 1 {
        return None;
    }

    let mean = |window: &[f64]| window.iter().sum::<f64>() / window.len() as f64;
    let n = closes.len();
    let fast_curr = mean(&closes[n - fast..]);
    let slow_curr = mean(&closes[n - slow..]);
    let fast_prev = mean(&closes[n - 1 - fast..n - 1]);
    let slow_prev = mean(&closes[n - 1 - slow..n - 1]);

    let prev_diff = fast_prev - slow_prev;
    let curr_diff = fast_curr - slow_curr;
    let cross = if prev_diff < 0.0 && curr_diff >= 0.0 {
        Some("gold_cross")
    } else if prev_diff > 0.0 && curr_diff <= 0.0 {
        Some("death_cross")
    } else {
        None
    };

    Some(MaCrossSignal {
        cross,
        fast_ma: fast_curr,
        slow_ma: slow_curr,
        prev_diff,
        curr_diff,
    })
}

/// Simple-average RSI over the last `period` deltas. Needs `period + 1`
/// closes. A window with no losses saturates at 100.
fn compute_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let window = &closes[closes.len() - (period + 1)..];
    let mut gain = 0.0;
    let mut loss = 0.0;
    for pair in window.windows(2) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            gain += delta;
        } else {
            loss -= delta;
        }
    }

    if loss == 0.0 {
        return Some(100.0);
    }
    let rs = gain / loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}
