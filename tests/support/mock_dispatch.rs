use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
enum SessionOp {
    SendFrame(Value),
    Drop,
}

/// Observable state of the mock dispatch server, shared with tests.
pub struct DispatchState {
    connections: AtomicUsize,
    auths: AtomicUsize,
    pings: AtomicUsize,
    reject_next_auth: AtomicBool,
    answer_pings: AtomicBool,
    acks: Mutex<Vec<Value>>,
    ack_notify: Notify,
    session: Mutex<Option<mpsc::UnboundedSender<SessionOp>>>,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            connections: AtomicUsize::new(0),
            auths: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            reject_next_auth: AtomicBool::new(false),
            answer_pings: AtomicBool::new(true),
            acks: Mutex::new(Vec::new()),
            ack_notify: Notify::new(),
            session: Mutex::new(None),
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn auths(&self) -> usize {
        self.auths.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// The next auth attempt is answered with `auth_error`.
    pub fn reject_next_auth(&self) {
        self.reject_next_auth.store(true, Ordering::SeqCst);
    }

    /// Pings are still counted but no pong goes back, as a stalled server
    /// would behave.
    pub fn swallow_pings(&self) {
        self.answer_pings.store(false, Ordering::SeqCst);
    }

    pub fn answer_pings(&self) {
        self.answer_pings.store(true, Ordering::SeqCst);
    }

    fn session_sender(&self) -> Result<mpsc::UnboundedSender<SessionOp>> {
        let slot = self.session.lock().expect("session slot poisoned");
        slot.clone().context("no authenticated session")
    }

    /// Sends a `command` frame over the live session.
    pub fn send_command(&self, id: &str, command_type: &str, payload: Value) -> Result<()> {
        let frame = json!({
            "type": "command",
            "id": id,
            "command_type": command_type,
            "payload": payload,
        });
        self.session_sender()?
            .send(SessionOp::SendFrame(frame))
            .map_err(|_| anyhow::anyhow!("session task stopped"))
    }

    /// Sends a server-ordered `shutdown` frame.
    pub fn send_shutdown(&self) -> Result<()> {
        self.session_sender()?
            .send(SessionOp::SendFrame(json!({ "type": "shutdown" })))
            .map_err(|_| anyhow::anyhow!("session task stopped"))
    }

    /// Severs the live session without a close handshake, as a crashed
    /// server would.
    pub fn drop_connection(&self) -> Result<()> {
        self.session_sender()?
            .send(SessionOp::Drop)
            .map_err(|_| anyhow::anyhow!("session task stopped"))
    }

    /// Waits until an ack for `command_id` arrives and returns it.
    pub async fn wait_for_ack(&self, command_id: &str, deadline: Duration) -> Result<Value> {
        let wait = async {
            loop {
                // Register before checking so a notification between the
                // check and the await is never lost.
                let notified = self.ack_notify.notified();
                {
                    let acks = self.acks.lock().expect("ack log poisoned");
                    if let Some(ack) = acks
                        .iter()
                        .find(|ack| ack["command_id"] == command_id)
                        .cloned()
                    {
                        return ack;
                    }
                }
                notified.await;
            }
        };
        match timeout(deadline, wait).await {
            Ok(ack) => Ok(ack),
            Err(_) => bail!("no ack for {command_id} within {deadline:?}"),
        }
    }

    pub async fn wait_for_auths(&self, count: usize, deadline: Duration) -> Result<()> {
        wait_until(deadline, || self.auths() >= count)
            .await
            .with_context(|| format!("server never saw {count} authentications"))
    }

    pub async fn wait_for_pings(&self, count: usize, deadline: Duration) -> Result<()> {
        wait_until(deadline, || self.pings() >= count)
            .await
            .with_context(|| format!("server never saw {count} pings"))
    }
}

async fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> Result<()> {
    let wait = async {
        while !predicate() {
            sleep(POLL_INTERVAL).await;
        }
    };
    timeout(deadline, wait)
        .await
        .map_err(|_| anyhow::anyhow!("condition not met within {deadline:?}"))
}

/// Minimal stand-in for the dispatch server: accepts websocket connections,
/// answers the auth handshake and pings, records acks, and lets tests inject
/// commands or sever the session.
pub struct MockDispatchServer {
    url: String,
    state: Arc<DispatchState>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl MockDispatchServer {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock dispatch listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock dispatch address")?;

        let state = Arc::new(DispatchState::new());
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let state = accept_state.clone();
                        let shutdown = accept_shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_session(stream, state, shutdown).await {
                                eprintln!("mock dispatch session ended: {err}");
                            }
                        });
                    }
                }
            }
        });

        Ok(Self {
            url: format!("ws://{addr}/agent"),
            state,
            shutdown,
            accept_task: Some(accept_task),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> Arc<DispatchState> {
        self.state.clone()
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

async fn serve_session(
    stream: TcpStream,
    state: Arc<DispatchState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ws: WebSocketStream<TcpStream> = accept_async(stream)
        .await
        .context("websocket handshake failed")?;
    state.connections.fetch_add(1, Ordering::SeqCst);

    // Auth handshake comes first; anything else is a protocol error.
    let first = match ws.next().await {
        Some(Ok(Message::Text(text))) => text,
        other => bail!("expected auth frame, got {other:?}"),
    };
    let auth: Value = serde_json::from_str(&first).context("auth frame is not JSON")?;
    if auth["type"] != "auth" || !auth["module_hash"].is_string() {
        bail!("malformed auth frame: {auth}");
    }

    if state.reject_next_auth.swap(false, Ordering::SeqCst) {
        let reply = json!({ "type": "auth_error", "message": "module hash not registered" });
        ws.send(Message::Text(reply.to_string())).await?;
        ws.close(None).await.ok();
        return Ok(());
    }

    ws.send(Message::Text(json!({ "type": "auth_ok" }).to_string()))
        .await?;

    // Install the session sender before ticking the auth counter so a test
    // that waited for this auth can inject commands immediately.
    let (ops_tx, mut ops_rx) = mpsc::unbounded_channel();
    {
        let mut slot = state.session.lock().expect("session slot poisoned");
        *slot = Some(ops_tx);
    }
    state.auths.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            op = ops_rx.recv() => match op {
                None | Some(SessionOp::Drop) => break,
                Some(SessionOp::SendFrame(frame)) => {
                    ws.send(Message::Text(frame.to_string())).await?;
                }
            },
            message = ws.next() => match message {
                None | Some(Err(_)) => break,
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    match frame["type"].as_str() {
                        Some("ping") => {
                            state.pings.fetch_add(1, Ordering::SeqCst);
                            if state.answer_pings.load(Ordering::SeqCst) {
                                let pong = json!({ "type": "pong", "ts": frame["ts"] });
                                ws.send(Message::Text(pong.to_string())).await?;
                            }
                        }
                        Some("ack") => {
                            {
                                let mut acks = state.acks.lock().expect("ack log poisoned");
                                acks.push(frame);
                            }
                            state.ack_notify.notify_waiters();
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    // Dropping the socket here severs the connection without a close
    // handshake, which is exactly what the reconnect tests need.
    Ok(())
}
