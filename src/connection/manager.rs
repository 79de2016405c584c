use crate::connection::backoff::{sleep_with_cancellation, ReconnectBackoff};
use crate::connection::frames::Frame;
use crate::dispatch::ack::AckResult;
use crate::dispatch::command::Command;
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, Error as AnyError};
use futures::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
const MIN_AUTH_DEADLINE: Duration = Duration::from_secs(5);

/// Lifecycle of the control connection, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// Failures surfaced to callers of the connection API. Transport drops are
/// handled internally by reconnecting and never reach handlers.
#[derive(Debug)]
pub enum ConnectionError {
    NotAuthenticated,
    ChannelClosed,
    AuthRejected { message: String },
    Transport { detail: String },
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::NotAuthenticated => {
                write!(f, "control connection is not authenticated")
            }
            ConnectionError::ChannelClosed => write!(f, "outbound frame channel closed"),
            ConnectionError::AuthRejected { message } => {
                write!(f, "authentication rejected by server: {message}")
            }
            ConnectionError::Transport { detail } => write!(f, "transport failure: {detail}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Connection parameters, usually derived from
/// [`AgentConfig::connection_settings`](crate::runtime::config::AgentConfig::connection_settings).
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub module_hash: String,
    pub heartbeat_interval: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
}

#[derive(Debug)]
struct SessionSender {
    generation: u64,
    tx: mpsc::Sender<Frame>,
}

/// Cloneable surface for sending acks and observing connection state,
/// handed to the orchestrator's dispatch tasks.
#[derive(Clone)]
pub struct ConnectionHandle {
    state_rx: watch::Receiver<ConnectionState>,
    session_out: Arc<Mutex<Option<SessionSender>>>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Sends one ack frame over the live session. Fails when no session is
    /// authenticated; the outbound writer task serializes deliveries.
    pub async fn send_ack(&self, ack: AckResult) -> Result<(), ConnectionError> {
        let sender = {
            let slot = self.session_out.lock().await;
            match slot.as_ref() {
                Some(session) => session.tx.clone(),
                None => return Err(ConnectionError::NotAuthenticated),
            }
        };

        let frame = Frame::Ack {
            command_id: ack.command_id,
            status: ack.status,
            summary: ack.summary,
            error: ack.error,
        };
        sender
            .send(frame)
            .await
            .map_err(|_| ConnectionError::ChannelClosed)
    }
}

/// Owns the websocket lifecycle: connect, authenticate, heartbeat, and
/// reconnect with exponential backoff until the run token is cancelled.
///
/// Inbound `command` frames are stamped and forwarded over an mpsc channel;
/// a server `shutdown` frame closes the connection and cancels the root
/// token so the whole runtime drains.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: Option<mpsc::Receiver<Command>>,
    session_out: Arc<Mutex<Option<SessionSender>>>,
    telemetry: Arc<Telemetry>,
    shutdown_root: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        telemetry: Arc<Telemetry>,
        shutdown_root: CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        Self {
            settings,
            state_tx: Arc::new(state_tx),
            state_rx,
            commands_tx,
            commands_rx: Some(commands_rx),
            session_out: Arc::new(Mutex::new(None)),
            telemetry,
            shutdown_root,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            state_rx: self.state_rx.clone(),
            session_out: self.session_out.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Hands out the inbound command stream. Yields `None` after the first
    /// call; there is exactly one consumer.
    pub fn take_commands(&mut self) -> Option<mpsc::Receiver<Command>> {
        self.commands_rx.take()
    }

    /// Starts the supervisor task that owns the connection until `run_token`
    /// is cancelled.
    pub fn spawn(&self, run_token: CancellationToken) -> JoinHandle<()> {
        let supervisor = Supervisor {
            settings: self.settings.clone(),
            state_tx: self.state_tx.clone(),
            commands_tx: self.commands_tx.clone(),
            session_out: self.session_out.clone(),
            telemetry: self.telemetry.clone(),
            shutdown_root: self.shutdown_root.clone(),
            run_token,
            generation: 0,
        };
        tokio::spawn(supervisor.run())
    }
}

enum SessionEnd {
    OperatorShutdown,
    ServerShutdown,
    Failed(AnyError),
}

struct Supervisor {
    settings: ConnectionSettings,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    commands_tx: mpsc::Sender<Command>,
    session_out: Arc<Mutex<Option<SessionSender>>>,
    telemetry: Arc<Telemetry>,
    shutdown_root: CancellationToken,
    run_token: CancellationToken,
    generation: u64,
}

impl Supervisor {
    async fn run(mut self) {
        let mut backoff = ReconnectBackoff::new(
            self.settings.reconnect_initial_delay,
            self.settings.reconnect_max_delay,
        );

        loop {
            if self.run_token.is_cancelled() {
                self.set_state(ConnectionState::Closed);
                return;
            }

            self.set_state(ConnectionState::Connecting);
            match self.run_session(&mut backoff).await {
                SessionEnd::OperatorShutdown => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                SessionEnd::ServerShutdown => {
                    tracing::info!("server ordered shutdown; closing control connection");
                    self.set_state(ConnectionState::Closed);
                    self.shutdown_root.cancel();
                    return;
                }
                SessionEnd::Failed(err) => {
                    self.telemetry.record_reconnect();
                    self.set_state(ConnectionState::Reconnecting);
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "control connection lost; reconnecting"
                    );
                    if !sleep_with_cancellation(delay, &self.run_token).await {
                        self.set_state(ConnectionState::Closed);
                        return;
                    }
                }
            }
        }
    }

    async fn run_session(&mut self, backoff: &mut ReconnectBackoff) -> SessionEnd {
        let connect = connect_async(self.settings.url.as_str());
        let ws = tokio::select! {
            _ = self.run_token.cancelled() => return SessionEnd::OperatorShutdown,
            result = connect => match result {
                Ok((ws, _response)) => ws,
                Err(err) => {
                    return SessionEnd::Failed(anyhow!("websocket connect failed: {err}"))
                }
            },
        };
        self.set_state(ConnectionState::Connected);

        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_CHANNEL_CAPACITY);

        // Writer task: the single owner of the sink. Queued frames (acks
        // included) keep draining even while the reader is busy.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!(error = %err, "dropping unencodable outbound frame");
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Text(text)).await {
                    tracing::debug!(error = %err, "outbound write failed; stopping writer");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let auth = Frame::Auth {
            module_hash: self.settings.module_hash.clone(),
        };
        if out_tx.send(auth).await.is_err() {
            writer.abort();
            return SessionEnd::Failed(anyhow!("writer task stopped before auth"));
        }

        let auth_deadline = (self.settings.heartbeat_interval * 2).max(MIN_AUTH_DEADLINE);
        let auth_result = tokio::select! {
            _ = self.run_token.cancelled() => {
                writer.abort();
                return SessionEnd::OperatorShutdown;
            }
            result = tokio::time::timeout(auth_deadline, await_auth_reply(&mut read)) => result,
        };
        match auth_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                drop(out_tx);
                let _ = writer.await;
                return SessionEnd::Failed(err.into());
            }
            Err(_) => {
                drop(out_tx);
                let _ = writer.await;
                return SessionEnd::Failed(anyhow!("authentication timed out"));
            }
        }

        self.generation += 1;
        let generation = self.generation;
        {
            let mut slot = self.session_out.lock().await;
            *slot = Some(SessionSender {
                generation,
                tx: out_tx.clone(),
            });
        }
        self.set_state(ConnectionState::Authenticated);
        backoff.reset();
        tracing::info!(url = %self.settings.url, generation, "control connection authenticated");

        // The heartbeat runs in its own task so command traffic never
        // delays pings, and a missed pong kills only this session.
        let session_token = self.run_token.child_token();
        let last_pong = Arc::new(std::sync::Mutex::new(Instant::now()));
        let heartbeat = tokio::spawn(heartbeat_loop(
            out_tx.clone(),
            last_pong.clone(),
            self.settings.heartbeat_interval,
            session_token.clone(),
        ));

        let end = loop {
            tokio::select! {
                _ = self.run_token.cancelled() => break SessionEnd::OperatorShutdown,
                _ = session_token.cancelled() => {
                    break SessionEnd::Failed(anyhow!("heartbeat timed out"))
                }
                message = read.next() => match message {
                    None => break SessionEnd::Failed(anyhow!("connection closed by server")),
                    Some(Err(err)) => {
                        break SessionEnd::Failed(anyhow!("websocket read failed: {err}"))
                    }
                    Some(Ok(Message::Text(text))) => {
                        match Frame::decode(&text) {
                            Ok(Frame::Command { id, command_type, payload }) => {
                                self.telemetry.record_command_received();
                                let command = Command::new(id, command_type, payload);
                                if self.commands_tx.send(command).await.is_err() {
                                    break SessionEnd::OperatorShutdown;
                                }
                            }
                            Ok(Frame::Pong { .. }) => {
                                let mut seen = last_pong
                                    .lock()
                                    .expect("heartbeat clock mutex poisoned");
                                *seen = Instant::now();
                            }
                            Ok(Frame::Ping { ts }) => {
                                let _ = out_tx.send(Frame::Pong { ts }).await;
                            }
                            Ok(Frame::Shutdown) => break SessionEnd::ServerShutdown,
                            Ok(other) => {
                                tracing::debug!(frame = ?other, "ignoring unexpected frame")
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "dropping undecodable frame")
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        break SessionEnd::Failed(anyhow!("server closed the connection"))
                    }
                    Some(Ok(_)) => {}
                }
            }
        };

        session_token.cancel();
        {
            // Only clear the slot this session installed; a faster
            // reconnect may already own it.
            let mut slot = self.session_out.lock().await;
            if slot.as_ref().map(|s| s.generation) == Some(generation) {
                *slot = None;
            }
        }
        drop(out_tx);
        let _ = heartbeat.await;
        let _ = writer.await;

        end
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = *self.state_tx.borrow();
        if previous != next {
            tracing::info!(from = %previous, to = %next, "connection state changed");
        }
        let _ = self.state_tx.send(next);
    }
}

async fn await_auth_reply<S>(read: &mut S) -> Result<(), ConnectionError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => match Frame::decode(&text) {
                Ok(Frame::AuthOk) => return Ok(()),
                Ok(Frame::AuthError { message }) => {
                    return Err(ConnectionError::AuthRejected { message })
                }
                Ok(_) | Err(_) => continue,
            },
            Ok(_) => continue,
            Err(err) => {
                return Err(ConnectionError::Transport {
                    detail: err.to_string(),
                })
            }
        }
    }
    Err(ConnectionError::Transport {
        detail: "connection closed during auth handshake".to_string(),
    })
}

async fn heartbeat_loop(
    out_tx: mpsc::Sender<Frame>,
    last_pong: Arc<std::sync::Mutex<Instant>>,
    interval: Duration,
    session_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session_token.cancelled() => break,
            _ = ticker.tick() => {
                let seen = *last_pong.lock().expect("heartbeat clock mutex poisoned");
                if seen.elapsed() > interval * 2 {
                    tracing::warn!("no pong within two heartbeat intervals; dropping session");
                    session_token.cancel();
                    break;
                }
                if out_tx.send(Frame::ping_now()).await.is_err() {
                    break;
                }
            }
        }
    }
}
