//! HTTP client seam for external data APIs. Houses the `TargetFetch` trait
//! consumed by batch workers, the generic `HttpFetchClient`, and the typed
//! per-request error surface.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

pub type FetchFuture<'a> = BoxFuture<'a, Result<Value, FetchError>>;

/// Typed failure for one request against an external API. Per-target errors
/// are counted into batch summaries; they never abort sibling requests.
#[derive(Debug)]
pub enum FetchError {
    Timeout,
    HttpStatus { status: u16 },
    RateLimited,
    MalformedResponse { detail: String },
    UnknownTarget { target: String },
    PoolExhausted,
    Transport { detail: String },
}

impl FetchError {
    /// True when the failure points at the credential rather than the
    /// target or the network.
    pub fn is_credential_fault(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 401 | 403 })
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Timeout => write!(f, "request timed out"),
            FetchError::HttpStatus { status } => write!(f, "unexpected HTTP status {status}"),
            FetchError::RateLimited => write!(f, "request rejected by upstream rate limiting"),
            FetchError::MalformedResponse { detail } => {
                write!(f, "response body could not be decoded: {detail}")
            }
            FetchError::UnknownTarget { target } => write!(f, "unknown target {target}"),
            FetchError::PoolExhausted => {
                write!(f, "no credential with remaining quota was available")
            }
            FetchError::Transport { detail } => write!(f, "transport failure: {detail}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Trait implemented by API adapters that fetch one target with one
/// credential. Batch workers drive it; tests substitute stubs.
pub trait TargetFetch: Send + Sync + 'static {
    fn fetch<'a>(&'a self, target: &'a str, credential: &'a str) -> FetchFuture<'a>;
}

/// Generic JSON-over-GET client: the target and credential travel as query
/// parameters. API-specific adapters with richer URL shapes live next to
/// their handlers.
#[derive(Debug, Clone)]
pub struct HttpFetchClient {
    http: reqwest::Client,
    base_url: String,
    target_param: String,
    credential_param: String,
    extra_params: Vec<(String, String)>,
}

impl HttpFetchClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            target_param: "target".to_string(),
            credential_param: "key".to_string(),
            extra_params: Vec::new(),
        })
    }

    pub fn with_param_names(
        mut self,
        target_param: impl Into<String>,
        credential_param: impl Into<String>,
    ) -> Self {
        self.target_param = target_param.into();
        self.credential_param = credential_param.into();
        self
    }

    pub fn with_extra_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((name.into(), value.into()));
        self
    }

    async fn get_json(&self, target: &str, credential: &str) -> Result<Value, FetchError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                (self.target_param.as_str(), target),
                (self.credential_param.as_str(), credential),
            ])
            .query(&self.extra_params)
            .send()
            .await
            .map_err(map_send_error)?;

        decode_json_response(response).await
    }
}

impl TargetFetch for HttpFetchClient {
    fn fetch<'a>(&'a self, target: &'a str, credential: &'a str) -> FetchFuture<'a> {
        Box::pin(self.get_json(target, credential))
    }
}

pub(crate) fn map_send_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport {
            detail: err.to_string(),
        }
    }
}

/// Shared status/body mapping for API adapters built on reqwest.
pub(crate) async fn decode_json_response(response: reqwest::Response) -> Result<Value, FetchError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited);
    }
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
        });
    }

    response.json().await.map_err(|err| {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::MalformedResponse {
                detail: err.to_string(),
            }
        }
    })
}
