use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::connection::manager::{ConnectionHandle, ConnectionManager, ConnectionState};
use crate::dispatch::command::Command;
use crate::dispatch::registry::Dispatcher;
use crate::runtime::config::AgentConfig;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};

/// Wires the control connection to the dispatcher.
///
/// The orchestrator owns the background tasks of the runtime: the connection
/// supervisor, the metrics reporter, and the dispatch loop that turns every
/// inbound command into a handler task and every handler result into an ack.
/// Cancelling the shutdown token (or a server `shutdown` frame) stops intake
/// and drains in-flight handlers, bounded by the configured drain timeout.
pub struct Orchestrator {
    config: AgentConfig,
    dispatcher: Arc<Dispatcher>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    connection: ConnectionManager,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl Orchestrator {
    pub fn new(
        config: AgentConfig,
        dispatcher: Dispatcher,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        let connection = ConnectionManager::new(
            config.connection_settings(),
            telemetry.clone(),
            shutdown.clone(),
        );
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            telemetry,
            shutdown,
            connection,
            tasks: Vec::new(),
            started: false,
        }
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn connection_handle(&self) -> ConnectionHandle {
        self.connection.handle()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    /// Spawns the runtime tasks. Callable once per orchestrator.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            bail!("orchestrator is already started");
        }

        let commands = self
            .connection
            .take_commands()
            .context("command stream was already consumed")?;

        let supervisor = self.connection.spawn(self.shutdown.child_token());

        let reporter = spawn_metrics_reporter(
            self.telemetry.clone(),
            self.shutdown.child_token(),
            self.config.metrics_interval(),
        );

        let dispatch = tokio::spawn(dispatch_loop(
            self.dispatcher.clone(),
            commands,
            self.connection.handle(),
            self.telemetry.clone(),
            self.shutdown.child_token(),
            self.config.drain_timeout(),
        ));

        self.tasks = vec![supervisor, reporter, dispatch];
        self.started = true;
        tracing::info!(url = %self.config.server_url(), "orchestrator started");
        Ok(())
    }

    /// Cancels the shutdown token and waits for every runtime task,
    /// including the dispatch loop's bounded drain.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "runtime task panicked during shutdown");
                }
            }
        }
        self.started = false;
        tracing::info!("orchestrator stopped");
    }

    /// Resolves when the shutdown token fires, whether from the operator
    /// or from a server-ordered shutdown.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
    }
}

/// Pulls commands off the connection in receipt order, runs each handler in
/// its own task, and delivers the resulting ack over the live session.
async fn dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    mut commands: mpsc::Receiver<Command>,
    connection: ConnectionHandle,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    let mut inflight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(result) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(err) = result {
                    if err.is_panic() {
                        tracing::error!(error = %err, "dispatch task panicked");
                    }
                }
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                let dispatcher = dispatcher.clone();
                let connection = connection.clone();
                let telemetry = telemetry.clone();
                inflight.spawn(async move {
                    let ack = dispatcher.dispatch(command).await;
                    let command_id = ack.command_id.clone();
                    match connection.send_ack(ack).await {
                        Ok(()) => telemetry.record_ack_sent(),
                        Err(err) => tracing::warn!(
                            command_id = %command_id,
                            error = %err,
                            "ack could not be delivered"
                        ),
                    }
                });
            }
        }
    }

    drain(inflight, drain_timeout).await;
}

async fn drain(mut inflight: JoinSet<()>, drain_timeout: Duration) {
    let pending = inflight.len();
    if pending == 0 {
        return;
    }

    tracing::info!(pending, "draining in-flight handlers");
    let all_done = async {
        while let Some(result) = inflight.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    tracing::error!(error = %err, "dispatch task panicked during drain");
                }
            }
        }
    };

    if timeout(drain_timeout, all_done).await.is_err() {
        tracing::warn!(
            timeout_ms = drain_timeout.as_millis() as u64,
            "drain timeout elapsed; aborting remaining handlers"
        );
        inflight.abort_all();
        while inflight.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::credentials::CredentialSpec;

    fn config() -> AgentConfig {
        AgentConfig::builder()
            .server_url("ws://127.0.0.1:1/agent")
            .module_hash("abc123")
            .store_path(":memory:")
            .credentials(vec![CredentialSpec {
                key: "key-a".to_string(),
                quota_limit: 100,
                window: Duration::from_secs(60),
            }])
            .reconnect_initial_delay(Duration::from_millis(10))
            .reconnect_max_delay(Duration::from_millis(20))
            .drain_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    fn orchestrator() -> Orchestrator {
        let telemetry = Arc::new(Telemetry::default());
        let dispatcher = Dispatcher::new(telemetry.clone());
        Orchestrator::new(config(), dispatcher, telemetry, CancellationToken::new())
    }

    #[tokio::test]
    async fn start_is_single_use() {
        let mut orchestrator = orchestrator();
        orchestrator.start().unwrap();
        let err = orchestrator.start().unwrap_err();
        assert!(format!("{err}").contains("already started"));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_all_tasks() {
        let mut orchestrator = orchestrator();
        orchestrator.start().unwrap();

        timeout(Duration::from_secs(5), orchestrator.stop())
            .await
            .expect("stop should finish promptly");
        assert_eq!(orchestrator.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn drain_aborts_stragglers_after_the_timeout() {
        let mut inflight: JoinSet<()> = JoinSet::new();
        inflight.spawn(std::future::pending());
        inflight.spawn(std::future::pending());

        timeout(
            Duration::from_secs(2),
            drain(inflight, Duration::from_millis(50)),
        )
        .await
        .expect("drain should abort tasks that never finish");
    }
}
