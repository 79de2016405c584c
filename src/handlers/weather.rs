use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;

use crate::dispatch::registry::{CommandHandler, HandlerFuture};
use crate::dispatch::HandlerReport;
use crate::fetch::client::{
    decode_json_response, map_send_error, FetchError, FetchFuture, TargetFetch,
};
use crate::fetch::Fetcher;
use crate::handlers::geo;
use crate::store::{Record, RecordStore};

/// Store domain holding one row per `(city, hour timestamp)`.
pub const WEATHER_DOMAIN: &str = "weather_hourly";

/// Command type served by [`WeatherHandler`].
pub const COMMAND_FETCH_WEATHER: &str = "fetch_weather";

/// Forecast horizon requested from the API when the command does not
/// narrow it.
pub const DEFAULT_FORECAST_DAYS: usize = 10;

/// Adapter for the MSN-style weather overview endpoint. The target is a
/// city name resolved to coordinates before the request goes out; the
/// credential travels as the `apikey` query parameter.
#[derive(Debug, Clone)]
pub struct WeatherApi {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    days: usize,
}

impl WeatherApi {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build weather HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            app_id: app_id.into(),
            days: DEFAULT_FORECAST_DAYS,
        })
    }

    pub fn with_days(mut self, days: usize) -> Self {
        self.days = days.max(1);
        self
    }

    async fn get_overview(&self, city: &str, credential: &str) -> Result<Value, FetchError> {
        let (lat, lon) = geo::coordinates_for(city).ok_or_else(|| FetchError::UnknownTarget {
            target: city.to_string(),
        })?;

        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("apikey", credential),
                ("appId", self.app_id.as_str()),
                ("units", "C"),
                ("region", "cn"),
                ("market", "zh-cn"),
                ("locale", "zh-cn"),
            ])
            .query(&[
                ("days", self.days.to_string()),
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
            ])
            .send()
            .await
            .map_err(map_send_error)?;

        decode_json_response(response).await
    }
}

impl TargetFetch for WeatherApi {
    fn fetch<'a>(&'a self, target: &'a str, credential: &'a str) -> FetchFuture<'a> {
        Box::pin(self.get_overview(target, credential))
    }
}

#[derive(Debug, Deserialize)]
struct WeatherPayload {
    cities: Vec<String>,
    /// Narrows how many forecast days are persisted. The outbound request
    /// always asks for the adapter's configured horizon
    /// ([`DEFAULT_FORECAST_DAYS`] unless overridden with `with_days`), so a
    /// larger value only sees what the response carries.
    days: Option<usize>,
}

/// Fetches hourly weather for a list of cities and persists one record per
/// on-the-hour data point. Replayed commands skip rows already stored.
pub struct WeatherHandler {
    fetcher: Arc<Fetcher>,
    store: Arc<dyn RecordStore>,
}

impl WeatherHandler {
    pub fn new(fetcher: Arc<Fetcher>, store: Arc<dyn RecordStore>) -> Self {
        Self { fetcher, store }
    }

    async fn run(&self, payload: &Value) -> Result<HandlerReport> {
        let payload: WeatherPayload =
            serde_json::from_value(payload.clone()).context("invalid fetch_weather payload")?;
        let days = payload.days.unwrap_or(DEFAULT_FORECAST_DAYS).max(1);

        let mut report = HandlerReport::with_requested(payload.cities.len() as u64);

        // Unknown cities fail up front; no request or quota is spent on them.
        let mut known = Vec::with_capacity(payload.cities.len());
        for city in payload.cities {
            if geo::known_city(&city) {
                known.push(city);
            } else {
                tracing::warn!(city = %city, "city has no known coordinates");
                report.failed += 1;
            }
        }

        for result in self.fetcher.fetch_batch(&known).await {
            let value = match result.outcome {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(city = %result.target, error = %err, "weather fetch failed");
                    report.failed += 1;
                    continue;
                }
            };

            let records = extract_hourly_records(&result.target, &value, days);
            if records.is_empty() {
                tracing::warn!(city = %result.target, "response contained no hourly points");
                report.failed += 1;
                continue;
            }

            match self.store.write_if_absent(WEATHER_DOMAIN, records).await {
                Ok(outcome) => {
                    report.inserted += outcome.inserted;
                    report.skipped += outcome.skipped;
                }
                Err(err) => {
                    tracing::error!(city = %result.target, error = %err, "weather store write failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

impl CommandHandler for WeatherHandler {
    fn execute<'a>(&'a self, payload: &'a Value) -> HandlerFuture<'a> {
        Box::pin(self.run(payload))
    }
}

/// Pulls the on-the-hour data points out of an overview response: the
/// current conditions (when sampled on the hour) plus up to `days` days of
/// hourly forecast entries.
fn extract_hourly_records(city: &str, response: &Value, days: usize) -> Vec<Record> {
    let mut records = Vec::new();

    let Some(weather) = response
        .pointer("/value/0/responses/0/weather/0")
        .filter(|w| w.is_object())
    else {
        return records;
    };

    if let Some(current) = weather.get("current") {
        if let Some(created) = current.get("created").and_then(Value::as_str) {
            if is_on_the_hour(created) {
                records.push(Record::new(city, created, current.clone()));
            }
        }
    }

    let forecast_days = weather
        .pointer("/forecast/days")
        .and_then(Value::as_array)
        .map(|d| d.as_slice())
        .unwrap_or(&[]);
    for day in forecast_days.iter().take(days) {
        let hourly = day
            .get("hourly")
            .and_then(Value::as_array)
            .map(|h| h.as_slice())
            .unwrap_or(&[]);
        for point in hourly {
            let Some(valid) = point.get("valid").and_then(Value::as_str) else {
                continue;
            };
            if is_on_the_hour(valid) {
                records.push(Record::new(city, valid, point.clone()));
            }
        }
    }

    records
}

/// True when the timestamp falls exactly on an hour boundary. Timestamps
/// that do not parse as RFC 3339 fall back to a substring check so slightly
/// malformed upstream data is not dropped wholesale.
fn is_on_the_hour(timestamp: &str) -> bool {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(dt) => {
            use chrono::Timelike;
            dt.minute() == 0 && dt.second() == 0
        }
        Err(_) => timestamp.contains(":00:00") || timestamp.ends_with(":00Z"),
    }
}
