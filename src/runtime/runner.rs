use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::connection::manager::ConnectionHandle;
use crate::dispatch::registry::Dispatcher;
use crate::runtime::config::AgentConfig;
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::telemetry::Telemetry;

/// Top-level entry point for embedding the agent in a process.
///
/// Owns the shutdown token and the orchestrator; `run_until_ctrl_c` blocks
/// until the operator interrupts the process or the server orders a
/// shutdown, then performs a bounded drain.
pub struct Runner {
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(config: AgentConfig, dispatcher: Dispatcher, telemetry: Arc<Telemetry>) -> Self {
        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator::new(config, dispatcher, telemetry, shutdown.clone());
        Self {
            orchestrator,
            shutdown,
        }
    }

    /// Token that stops the runtime when cancelled. Cloneable; hand it to
    /// supervising code that needs to trigger shutdown programmatically.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.orchestrator.telemetry()
    }

    pub fn connection_handle(&self) -> ConnectionHandle {
        self.orchestrator.connection_handle()
    }

    pub fn start(&mut self) -> Result<()> {
        self.orchestrator.start()
    }

    pub async fn stop(&mut self) {
        self.orchestrator.stop().await;
    }

    /// Starts the runtime and parks until ctrl-c or token cancellation,
    /// then drains and stops.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start()?;

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                tracing::info!("shutdown token cancelled; stopping runtime");
            }
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => tracing::info!("ctrl-c received; stopping runtime"),
                    Err(err) => {
                        tracing::warn!(error = %err, "ctrl-c listener failed; stopping runtime");
                    }
                }
            }
        }

        self.stop().await;
        Ok(())
    }
}
