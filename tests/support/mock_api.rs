use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Behaviour knobs for the mock data API, matched against the raw query
/// string of each request.
#[derive(Clone, Default)]
struct ApiBehavior {
    /// Requests whose query contains this substring never answer in time.
    hang_when_contains: Arc<Mutex<Option<String>>>,
}

/// HTTP stand-in for an external data API. Answers every GET with a canned
/// JSON body unless a failure behaviour matches the query string.
pub struct MockDataApi {
    url: String,
    requests: Arc<AtomicUsize>,
    behavior: ApiBehavior,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockDataApi {
    pub async fn start(response: Value) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock API listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock API address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock API listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock API listener non-blocking")?;

        let requests = Arc::new(AtomicUsize::new(0));
        let behavior = ApiBehavior::default();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let response = Arc::new(response);
        let service_requests = requests.clone();
        let service_behavior = behavior.clone();
        let make_service = make_service_fn(move |_| {
            let response = response.clone();
            let requests = service_requests.clone();
            let behavior = service_behavior.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    serve_request(
                        response.clone(),
                        requests.clone(),
                        behavior.clone(),
                        req,
                    )
                }))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock API server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock API server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{addr}/overview"),
            requests,
            behavior,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Requests whose query string contains `needle` hang past any client
    /// timeout.
    pub fn hang_when_query_contains(&self, needle: impl Into<String>) {
        let mut slot = self
            .behavior
            .hang_when_contains
            .lock()
            .expect("behavior poisoned");
        *slot = Some(needle.into());
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.handle.take() {
            // Deliberately hung requests would stall a graceful shutdown.
            if tokio::time::timeout(Duration::from_millis(500), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }
}

async fn serve_request(
    response: Arc<Value>,
    requests: Arc<AtomicUsize>,
    behavior: ApiBehavior,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    requests.fetch_add(1, Ordering::SeqCst);
    let query = req.uri().query().unwrap_or("").to_string();

    let hang = behavior
        .hang_when_contains
        .lock()
        .expect("behavior poisoned")
        .clone();
    if let Some(needle) = hang {
        if query.contains(&needle) {
            // Far past any client timeout used in the tests.
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::GATEWAY_TIMEOUT;
            return Ok(response);
        }
    }

    let body = Body::from(response.to_string());
    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(body)
        .expect("static response should build");
    Ok(response)
}
