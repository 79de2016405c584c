pub mod connection;
pub mod dispatch;
pub mod fetch;
pub mod handlers;
pub mod runtime;
pub mod store;

pub use connection::frames::Frame;
pub use connection::manager::{
    ConnectionError, ConnectionHandle, ConnectionManager, ConnectionSettings, ConnectionState,
};
pub use dispatch::{
    AckErrorKind, AckResult, AckStatus, Command, CommandHandler, DispatchError, Dispatcher,
    HandlerFuture, HandlerReport,
};
pub use fetch::{
    CredentialPool, CredentialSpec, FetchError, FetchResult, Fetcher, HttpFetchClient,
    LimiterScope, PoolExhaustedError, RateLimiter, TargetFetch, DEFAULT_MAX_CONCURRENCY,
};
pub use runtime::config::{AgentConfig, AgentConfigBuilder, AgentConfigParams};
pub use runtime::orchestrator::Orchestrator;
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use store::{MemoryStore, Record, RecordStore, SqliteStore, WriteOutcome};
