use crate::connection::manager::ConnectionSettings;
use crate::fetch::credentials::CredentialSpec;
use crate::fetch::limiter::LimiterScope;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
const DEFAULT_RECONNECT_INITIAL_DELAY_SECS: u64 = 1;
const DEFAULT_RECONNECT_MAX_DELAY_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FETCH_CONCURRENCY: usize = 5;
const DEFAULT_RATE_LIMIT_INTERVAL_MS: u64 = 200;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Runtime configuration for the agent.
///
/// All instances must be constructed via [`AgentConfig::builder`] or
/// [`AgentConfig::new`] so invariants are validated before any consumer
/// observes the values. The crate never reads environment variables; the
/// embedding process resolves its own sources and hands over plain values.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    server_url: String,
    module_hash: String,
    store_path: String,
    credentials: Vec<CredentialSpec>,
    heartbeat_interval: Duration,
    reconnect_initial_delay: Duration,
    reconnect_max_delay: Duration,
    request_timeout: Duration,
    fetch_concurrency: usize,
    rate_limit_interval: Duration,
    rate_limit_scope: LimiterScope,
    drain_timeout: Duration,
    metrics_interval: Duration,
}

pub struct AgentConfigParams {
    pub server_url: String,
    pub module_hash: String,
    pub store_path: String,
    pub credentials: Vec<CredentialSpec>,
    pub heartbeat_interval: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub request_timeout: Duration,
    pub fetch_concurrency: usize,
    pub rate_limit_interval: Duration,
    pub rate_limit_scope: LimiterScope,
    pub drain_timeout: Duration,
    pub metrics_interval: Duration,
}

impl AgentConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`AgentConfig::builder`] when many values use defaults.
    pub fn new(params: AgentConfigParams) -> Result<Self> {
        let AgentConfigParams {
            server_url,
            module_hash,
            store_path,
            credentials,
            heartbeat_interval,
            reconnect_initial_delay,
            reconnect_max_delay,
            request_timeout,
            fetch_concurrency,
            rate_limit_interval,
            rate_limit_scope,
            drain_timeout,
            metrics_interval,
        } = params;

        let config = Self {
            server_url: trimmed_string(server_url),
            module_hash: trimmed_string(module_hash),
            store_path: trimmed_string(store_path),
            credentials,
            heartbeat_interval,
            reconnect_initial_delay,
            reconnect_max_delay,
            request_timeout,
            fetch_concurrency,
            rate_limit_interval,
            rate_limit_scope,
            drain_timeout,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Control-connection endpoint (including scheme).
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Identity presented during the auth handshake.
    pub fn module_hash(&self) -> &str {
        &self.module_hash
    }

    /// Filesystem path of the SQLite record store.
    pub fn store_path(&self) -> &str {
        &self.store_path
    }

    /// API credentials managed by the rotation pool.
    pub fn credentials(&self) -> &[CredentialSpec] {
        &self.credentials
    }

    /// Interval between outbound pings.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        self.reconnect_initial_delay
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        self.reconnect_max_delay
    }

    /// Per-request timeout applied to external API calls.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Cap on concurrent in-flight fetches per batch.
    pub fn fetch_concurrency(&self) -> usize {
        self.fetch_concurrency
    }

    /// Minimum spacing between requests. Zero disables spacing.
    pub fn rate_limit_interval(&self) -> Duration {
        self.rate_limit_interval
    }

    pub fn rate_limit_scope(&self) -> LimiterScope {
        self.rate_limit_scope
    }

    /// How long shutdown waits for in-flight handlers before aborting them.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Extracts the parameters consumed by the connection manager.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            url: self.server_url.clone(),
            module_hash: self.module_hash.clone(),
            heartbeat_interval: self.heartbeat_interval,
            reconnect_initial_delay: self.reconnect_initial_delay,
            reconnect_max_delay: self.reconnect_max_delay,
        }
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_server_url(&self.server_url)?;
        ensure_not_empty(&self.module_hash, "module_hash")?;
        ensure_not_empty(&self.store_path, "store_path")?;

        if self.credentials.is_empty() {
            bail!("credentials must contain at least one entry");
        }
        for (index, credential) in self.credentials.iter().enumerate() {
            if credential.key.trim().is_empty() {
                bail!("credential {index} has an empty key");
            }
            if credential.quota_limit == 0 {
                bail!("credential {index} must allow at least one request per window");
            }
            if credential.window.is_zero() {
                bail!("credential {index} must use a non-zero quota window");
            }
        }

        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be greater than 0");
        }

        if self.reconnect_initial_delay.is_zero() {
            bail!("reconnect_initial_delay must be greater than 0");
        }

        if self.reconnect_max_delay < self.reconnect_initial_delay {
            bail!("reconnect_max_delay must be at least reconnect_initial_delay");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        if self.fetch_concurrency == 0 {
            bail!("fetch_concurrency must be greater than 0");
        }

        if self.drain_timeout.is_zero() {
            bail!("drain_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct AgentConfigBuilder {
    server_url: Option<String>,
    module_hash: Option<String>,
    store_path: Option<String>,
    credentials: Option<Vec<CredentialSpec>>,
    heartbeat_interval: Option<Duration>,
    reconnect_initial_delay: Option<Duration>,
    reconnect_max_delay: Option<Duration>,
    request_timeout: Option<Duration>,
    fetch_concurrency: Option<usize>,
    rate_limit_interval: Option<Duration>,
    rate_limit_scope: Option<LimiterScope>,
    drain_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl AgentConfigBuilder {
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    pub fn module_hash(mut self, hash: impl Into<String>) -> Self {
        self.module_hash = Some(hash.into());
        self
    }

    pub fn store_path(mut self, path: impl Into<String>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn credentials(mut self, credentials: Vec<CredentialSpec>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = Some(delay);
        self
    }

    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = Some(delay);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch_concurrency = Some(concurrency);
        self
    }

    pub fn rate_limit_interval(mut self, interval: Duration) -> Self {
        self.rate_limit_interval = Some(interval);
        self
    }

    pub fn rate_limit_scope(mut self, scope: LimiterScope) -> Self {
        self.rate_limit_scope = Some(scope);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<AgentConfig> {
        let params = AgentConfigParams {
            server_url: self.server_url.context("server_url is required")?,
            module_hash: self.module_hash.context("module_hash is required")?,
            store_path: self.store_path.context("store_path is required")?,
            credentials: self.credentials.context("credentials are required")?,
            heartbeat_interval: self
                .heartbeat_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS)),
            reconnect_initial_delay: self
                .reconnect_initial_delay
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RECONNECT_INITIAL_DELAY_SECS)),
            reconnect_max_delay: self
                .reconnect_max_delay
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RECONNECT_MAX_DELAY_SECS)),
            request_timeout: self
                .request_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            fetch_concurrency: self.fetch_concurrency.unwrap_or(DEFAULT_FETCH_CONCURRENCY),
            rate_limit_interval: self
                .rate_limit_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_RATE_LIMIT_INTERVAL_MS)),
            rate_limit_scope: self.rate_limit_scope.unwrap_or(LimiterScope::PerCredential),
            drain_timeout: self
                .drain_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        AgentConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_server_url(url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        bail!("server_url must start with ws:// or wss://");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> CredentialSpec {
        CredentialSpec {
            key: "key-a".to_string(),
            quota_limit: 100,
            window: Duration::from_secs(60),
        }
    }

    fn base_builder() -> AgentConfigBuilder {
        AgentConfig::builder()
            .server_url("ws://localhost:9000/agent")
            .module_hash("abc123")
            .store_path("/tmp/agent.db")
            .credentials(vec![credential()])
    }

    #[test]
    fn builder_produces_valid_config() {
        let config = base_builder().build().unwrap();
        assert_eq!(config.server_url(), "ws://localhost:9000/agent");
        assert_eq!(
            config.heartbeat_interval(),
            Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS)
        );
        assert_eq!(config.fetch_concurrency(), DEFAULT_FETCH_CONCURRENCY);
        assert_eq!(config.rate_limit_scope(), LimiterScope::PerCredential);
        assert_eq!(
            config.drain_timeout(),
            Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS)
        );
        assert_eq!(
            config.metrics_interval(),
            telemetry::DEFAULT_METRICS_INTERVAL
        );
    }

    #[test]
    fn overrides_are_honoured() {
        let config = base_builder()
            .heartbeat_interval(Duration::from_millis(500))
            .fetch_concurrency(2)
            .rate_limit_scope(LimiterScope::Global)
            .rate_limit_interval(Duration::ZERO)
            .build()
            .expect("config should build");
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.fetch_concurrency(), 2);
        assert_eq!(config.rate_limit_scope(), LimiterScope::Global);
        assert!(config.rate_limit_interval().is_zero());
    }

    #[test]
    fn missing_required_fields_error() {
        let err = AgentConfig::builder()
            .module_hash("abc123")
            .store_path("/tmp/agent.db")
            .credentials(vec![credential()])
            .build()
            .unwrap_err();
        assert!(
            format!("{err}").contains("server_url"),
            "error should mention missing server_url"
        );

        let err = base_builder().credentials(Vec::new()).build().unwrap_err();
        assert!(
            format!("{err}").contains("credentials"),
            "error should mention empty credentials"
        );
    }

    #[test]
    fn validation_catches_invalid_values() {
        let err = base_builder()
            .server_url("http://localhost:9000")
            .build()
            .unwrap_err();
        assert!(
            format!("{err}").contains("ws:// or wss://"),
            "error should mention URL scheme"
        );

        let err = base_builder()
            .heartbeat_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("heartbeat_interval"));

        let err = base_builder()
            .reconnect_max_delay(Duration::from_millis(1))
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("reconnect_max_delay"));

        let err = base_builder().fetch_concurrency(0).build().unwrap_err();
        assert!(format!("{err}").contains("fetch_concurrency"));

        let err = base_builder()
            .drain_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("drain_timeout"));
    }

    #[test]
    fn credential_entries_are_validated() {
        let bad_key = CredentialSpec {
            key: "  ".to_string(),
            quota_limit: 10,
            window: Duration::from_secs(60),
        };
        let err = base_builder()
            .credentials(vec![bad_key])
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("empty key"));

        let zero_quota = CredentialSpec {
            key: "key-a".to_string(),
            quota_limit: 0,
            window: Duration::from_secs(60),
        };
        let err = base_builder()
            .credentials(vec![zero_quota])
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("at least one request"));
    }

    #[test]
    fn connection_settings_mirror_the_config() {
        let config = base_builder().build().unwrap();
        let settings = config.connection_settings();
        assert_eq!(settings.url, config.server_url());
        assert_eq!(settings.module_hash, config.module_hash());
        assert_eq!(settings.heartbeat_interval, config.heartbeat_interval());
    }

    #[test]
    fn direct_constructor_runs_validation() {
        let err = AgentConfig::new(AgentConfigParams {
            server_url: "ws://localhost:9000".into(),
            module_hash: "abc123".into(),
            store_path: "/tmp/agent.db".into(),
            credentials: vec![credential()],
            heartbeat_interval: Duration::from_secs(10),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            fetch_concurrency: 0,
            rate_limit_interval: Duration::from_millis(200),
            rate_limit_scope: LimiterScope::PerCredential,
            drain_timeout: Duration::from_secs(30),
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        })
        .unwrap_err();

        assert!(
            format!("{err}").contains("fetch_concurrency"),
            "error should mention invalid fetch_concurrency"
        );
    }
}
