//! Concurrent data fetching against rate-limited external APIs: credential
//! rotation with quota windows, request spacing, the `TargetFetch` client
//! seam, bounded batch execution, and fetch metrics.

pub mod batch;
pub mod client;
pub mod credentials;
pub mod limiter;
pub mod metrics;

pub use batch::{FetchResult, Fetcher, DEFAULT_MAX_CONCURRENCY};
pub use client::{FetchError, FetchFuture, HttpFetchClient, TargetFetch};
pub use credentials::{CredentialPool, CredentialSpec, CredentialStatus, PoolExhaustedError};
pub use limiter::{LimiterScope, RateLimiter};
pub use metrics::FetchMetricsSnapshot;
