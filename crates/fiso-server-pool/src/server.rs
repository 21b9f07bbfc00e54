use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use axum::Router;
use fiso_core::{Event, EventHandler as RouteHandler, FisoError, FisoResult};
use http::{Method, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// 10 MiB; generous enough for any realistic ingress payload without
/// letting a single connection exhaust memory.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// One listener shared by every pre-registered `(addr, path)` route on that
/// address. `routes` maps a path to `None` (pre-registered, placeholder
/// still active) or `Some(handler)` (attached via `SetHandler`).
pub(crate) struct SharedServer {
    addr: SocketAddr,
    routes: RwLock<HashMap<String, Option<Arc<dyn RouteHandler>>>>,
    metrics: RwLock<Option<(String, PrometheusHandle)>>,
    state: Mutex<ServerState>,
    ready_tx: watch::Sender<Option<SocketAddr>>,
}

enum ServerState {
    Created,
    Started {
        bound_addr: SocketAddr,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
}

impl SharedServer {
    pub(crate) fn new(addr: SocketAddr) -> Arc<Self> {
        let (ready_tx, _rx) = watch::channel(None);
        Arc::new(Self {
            addr,
            routes: RwLock::new(HashMap::new()),
            metrics: RwLock::new(None),
            state: Mutex::new(ServerState::Created),
            ready_tx,
        })
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) async fn register_path(&self, path: &str) -> FisoResult<()> {
        let mut routes = self.routes.write().await;
        if routes.contains_key(path) {
            return Err(FisoError::Internal(format!(
                "duplicate route registration for {} {path:?}",
                self.addr
            )));
        }
        routes.insert(path.to_string(), None);
        Ok(())
    }

    pub(crate) async fn set_handler(
        &self,
        path: &str,
        handler: Arc<dyn RouteHandler>,
    ) -> FisoResult<()> {
        let mut routes = self.routes.write().await;
        match routes.get_mut(path) {
            Some(slot) => {
                *slot = Some(handler);
                Ok(())
            }
            None => Err(FisoError::Internal(format!(
                "no route pre-registered for {} {path:?}",
                self.addr
            ))),
        }
    }

    pub(crate) async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Registers `path` as a `GET` Prometheus exposition-format endpoint on
    /// this listener, reusing the same shared server that already serves
    /// pooled HTTP sources rather than opening a second listener (§6).
    pub(crate) async fn register_metrics(&self, path: &str, handle: PrometheusHandle) -> FisoResult<()> {
        let mut metrics = self.metrics.write().await;
        if metrics.is_some() {
            return Err(FisoError::Internal(format!(
                "metrics already registered on {}",
                self.addr
            )));
        }
        *metrics = Some((path.to_string(), handle));
        Ok(())
    }

    pub(crate) fn ready_rx(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.ready_tx.subscribe()
    }

    pub(crate) async fn bound_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            ServerState::Started { bound_addr, .. } => Some(*bound_addr),
            ServerState::Created => None,
        }
    }

    /// Opens the listener and starts serving, unless already started. A
    /// second `start` on an already-started server is a no-op returning the
    /// address it's already bound to (see §9 Open Questions).
    pub(crate) async fn start(self: &Arc<Self>) -> FisoResult<SocketAddr> {
        let mut state = self.state.lock().await;
        if let ServerState::Started { bound_addr, .. } = &*state {
            return Ok(*bound_addr);
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|err| FisoError::Internal(format!("failed to bind {}: {err}", self.addr)))?;
        let bound_addr = listener
            .local_addr()
            .map_err(|err| FisoError::Internal(format!("failed to read bound address: {err}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let this = Arc::clone(self);
        let router = Router::new().fallback_service(tower::service_fn(move |req: Request| {
            let this = Arc::clone(&this);
            async move { Ok::<_, std::convert::Infallible>(dispatch(this, req).await) }
        }));

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                tracing::error!(%err, %bound_addr, "shared server task exited with error");
            }
        });

        *state = ServerState::Started {
            bound_addr,
            shutdown: shutdown_tx,
            task,
        };
        drop(state);
        self.ready_tx.send_replace(Some(bound_addr));
        tracing::info!(addr = %bound_addr, "shared server listening");
        Ok(bound_addr)
    }

    /// A no-op if the server was never started, per the `Close` invariant.
    pub(crate) async fn shutdown(&self) -> FisoResult<()> {
        let mut state = self.state.lock().await;
        let ServerState::Started { .. } = &*state else {
            return Ok(());
        };
        let ServerState::Started { shutdown, task, .. } =
            std::mem::replace(&mut *state, ServerState::Created)
        else {
            unreachable!("just matched Started above");
        };
        let _ = shutdown.send(());
        let _ = task.await;
        Ok(())
    }
}

async fn dispatch(server: Arc<SharedServer>, req: Request) -> Response {
    if req.method() == Method::GET {
        if let Some(resp) = dispatch_metrics(&server, req.uri().path()).await {
            return resp;
        }
    }
    if req.method() != Method::POST {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    let path = req.uri().path().to_string();

    let slot = {
        let routes = server.routes.read().await;
        routes.get(&path).cloned()
    };
    let handler = match slot {
        None => return text_response(StatusCode::NOT_FOUND, "no route registered for this path"),
        Some(None) => return text_response(StatusCode::SERVICE_UNAVAILABLE, "handler not ready"),
        Some(Some(handler)) => handler,
    };

    let mut headers = BTreeMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers.entry(name.to_string()).or_insert_with(|| v.to_string());
        }
    }

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {err}"),
            )
        }
    };

    let event = Event::new(body.to_vec())
        .with_headers(headers)
        .with_topic("http");

    match handler.handle(event).await {
        Ok(()) => text_response(StatusCode::OK, ""),
        Err(err) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

/// Renders the metrics response for a `GET` to the registered metrics path.
/// Returns `None` for any other `GET` path so the caller falls through to
/// the ordinary non-POST handling (§4.6: "reject non-POST with 405") instead
/// of shadowing a registered event route with a metrics-shaped 404.
async fn dispatch_metrics(server: &Arc<SharedServer>, path: &str) -> Option<Response> {
    let metrics = server.metrics.read().await;
    match &*metrics {
        Some((metrics_path, handle)) if metrics_path == path => Some(
            Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Body::from(handle.render()))
                .expect("static response parts always build"),
        ),
        _ => None,
    }
}

fn text_response(status: StatusCode, body: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body.to_string()))
        .expect("static response parts always build")
}
