use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::dispatch::registry::{CommandHandler, HandlerFuture};
use crate::dispatch::HandlerReport;
use crate::fetch::client::{decode_json_response, map_send_error, FetchFuture, TargetFetch};
use crate::fetch::Fetcher;
use crate::store::{Record, RecordStore};

/// Store domain holding one row per `(stock code, trade timestamp)`.
pub const QUOTES_DOMAIN: &str = "stock_quotes";

/// Command type served by [`QuotesHandler`].
pub const COMMAND_FETCH_QUOTES: &str = "fetch_quotes";

/// Adapter for the licensed quote endpoint. The target is a normalized
/// stock code; the license key travels as the `license` query parameter.
#[derive(Debug, Clone)]
pub struct QuoteApi {
    http: reqwest::Client,
    base_url: String,
}

impl QuoteApi {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build quote HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn get_quote(
        &self,
        code: &str,
        credential: &str,
    ) -> Result<Value, crate::fetch::FetchError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("symbol", code), ("license", credential)])
            .send()
            .await
            .map_err(map_send_error)?;

        decode_json_response(response).await
    }
}

impl TargetFetch for QuoteApi {
    fn fetch<'a>(&'a self, target: &'a str, credential: &'a str) -> FetchFuture<'a> {
        Box::pin(self.get_quote(target, credential))
    }
}

#[derive(Debug, Deserialize)]
struct QuotesPayload {
    codes: Vec<String>,
}

/// Fetches real-time quotes for a list of stock codes and persists one
/// record per `(code, trade timestamp)`. License rotation and per-license
/// quota come from the shared credential pool.
pub struct QuotesHandler {
    fetcher: Arc<Fetcher>,
    store: Arc<dyn RecordStore>,
}

impl QuotesHandler {
    pub fn new(fetcher: Arc<Fetcher>, store: Arc<dyn RecordStore>) -> Self {
        Self { fetcher, store }
    }

    async fn run(&self, payload: &Value) -> Result<HandlerReport> {
        let payload: QuotesPayload =
            serde_json::from_value(payload.clone()).context("invalid fetch_quotes payload")?;

        let mut report = HandlerReport::with_requested(payload.codes.len() as u64);
        let codes: Vec<String> = payload
            .codes
            .iter()
            .map(|code| normalize_stock_code(code))
            .collect();

        for result in self.fetcher.fetch_batch(&codes).await {
            let value = match result.outcome {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(code = %result.target, error = %err, "quote fetch failed");
                    report.failed += 1;
                    continue;
                }
            };

            let Some(observed_at) = trade_timestamp(&value) else {
                tracing::warn!(code = %result.target, "quote response carries no trade timestamp");
                report.failed += 1;
                continue;
            };

            let record = Record::new(result.target.clone(), observed_at, value);
            match self.store.write_if_absent(QUOTES_DOMAIN, vec![record]).await {
                Ok(outcome) => {
                    report.inserted += outcome.inserted;
                    report.skipped += outcome.skipped;
                }
                Err(err) => {
                    tracing::error!(code = %result.target, error = %err, "quote store write failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

impl CommandHandler for QuotesHandler {
    fn execute<'a>(&'a self, payload: &'a Value) -> HandlerFuture<'a> {
        Box::pin(self.run(payload))
    }
}

/// Normalizes a raw stock code to its market-prefixed form: six digits
/// starting with 6 map to Shanghai, 0 or 3 to Shenzhen. Codes that already
/// carry a separator (`.` or `-`) pass through uppercased.
pub fn normalize_stock_code(raw: &str) -> String {
    let sanitized = raw.trim().to_uppercase();
    if sanitized.contains('.') || sanitized.contains('-') {
        return sanitized;
    }

    let digits: String = sanitized.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 6 {
        if digits.starts_with('6') {
            return format!("SH{digits}");
        }
        if digits.starts_with('0') || digits.starts_with('3') {
            return format!("SZ{digits}");
        }
    }

    sanitized
}

fn trade_timestamp(value: &Value) -> Option<String> {
    for key in ["timestamp", "time", "trade_time"] {
        if let Some(ts) = value.get(key).and_then(Value::as_str) {
            return Some(ts.to_string());
        }
    }
    None
}
