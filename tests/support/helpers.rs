use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use outpost::handlers::weather::{WeatherApi, WeatherHandler, COMMAND_FETCH_WEATHER};
use outpost::{
    AgentConfig, ConnectionState, CredentialPool, CredentialSpec, Dispatcher, Fetcher,
    Orchestrator, RateLimiter, RecordStore, Telemetry,
};

pub fn init_tracing() {
    outpost::init_tracing();
}

/// Overview response with two on-the-hour forecast points and one
/// half-hour point that must be filtered out. Each successfully fetched
/// city therefore yields exactly two records.
pub fn weather_overview() -> Value {
    json!({
        "value": [{
            "responses": [{
                "weather": [{
                    "current": { "created": "2026-08-23T07:30:00Z", "temp": 29.0 },
                    "forecast": {
                        "days": [{
                            "hourly": [
                                { "valid": "2026-08-23T08:00:00Z", "temp": 30.0 },
                                { "valid": "2026-08-23T08:30:00Z", "temp": 30.5 },
                                { "valid": "2026-08-23T09:00:00Z", "temp": 31.0 }
                            ]
                        }]
                    }
                }]
            }]
        }]
    })
}

pub fn test_config(server_url: &str, request_timeout: Duration) -> Result<AgentConfig> {
    AgentConfig::builder()
        .server_url(server_url)
        .module_hash("it-weather-module")
        .store_path(":memory:")
        .credentials(vec![CredentialSpec {
            key: "weather-key".to_string(),
            quota_limit: 1000,
            window: Duration::from_secs(60),
        }])
        .heartbeat_interval(Duration::from_millis(150))
        .reconnect_initial_delay(Duration::from_millis(50))
        .reconnect_max_delay(Duration::from_millis(200))
        .request_timeout(request_timeout)
        .rate_limit_interval(Duration::ZERO)
        .drain_timeout(Duration::from_secs(2))
        .metrics_interval(Duration::from_secs(1))
        .build()
}

/// Wires a full runtime around the weather handler: credential pool, rate
/// limiter, bounded fetcher, dispatcher, and orchestrator.
pub fn build_weather_runtime(
    config: AgentConfig,
    api_url: &str,
    store: Arc<dyn RecordStore>,
) -> Result<(Orchestrator, Arc<Telemetry>, CancellationToken)> {
    let telemetry = Arc::new(Telemetry::default());

    let api = WeatherApi::new(api_url, "it-app", config.request_timeout())?;
    let pool = Arc::new(CredentialPool::new(config.credentials().to_vec()));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_interval(),
        config.rate_limit_scope(),
    ));
    let fetcher = Arc::new(Fetcher::new(
        Arc::new(api),
        pool,
        limiter,
        config.fetch_concurrency(),
    ));

    let mut dispatcher = Dispatcher::new(telemetry.clone());
    dispatcher.register(
        COMMAND_FETCH_WEATHER,
        Arc::new(WeatherHandler::new(fetcher, store)),
    )?;

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(config, dispatcher, telemetry.clone(), shutdown.clone());
    Ok((orchestrator, telemetry, shutdown))
}

/// Waits until the connection reaches `target`, observing every transition
/// through the watch channel.
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    target: ConnectionState,
    deadline: Duration,
) -> Result<()> {
    let mut states = orchestrator.subscribe_connection_state();
    let wait = async {
        loop {
            if *states.borrow() == target {
                return Ok(());
            }
            if states.changed().await.is_err() {
                bail!("state channel closed before reaching {target}");
            }
        }
    };
    match timeout(deadline, wait).await {
        Ok(result) => result,
        Err(_) => bail!("connection never reached {target} within {deadline:?}"),
    }
}
