//! Runtime wiring: validated configuration, telemetry, the orchestrator
//! that pumps commands from the connection into the dispatcher, and the
//! signal-aware runner.

pub mod config;
pub mod orchestrator;
pub mod runner;
pub mod telemetry;

pub use config::{AgentConfig, AgentConfigBuilder, AgentConfigParams};
pub use orchestrator::Orchestrator;
pub use runner::Runner;
pub use telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
