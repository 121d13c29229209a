//! Host process: HTTP listener, auth layer and discovery responder.
//!
//! Each connection is served on its own task. `HostConfig` is read-only after
//! construction, so handlers share it without locks; the filesystem is the
//! only shared mutable resource.

use crate::auth;
use crate::config::{self, HostConfig};
use crate::discovery;
use crate::error::CtError;
use crate::logger::Logger;
use crate::protocol::{endpoint, CHUNK_SIZE, MAX_UPLOAD_BYTES, PASSWORD_HEADER, TOKEN_HEADER};
use crate::service::{RunRequest, TransferService};
use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

impl IntoResponse for CtError {
    fn into_response(self) -> Response {
        let status = match &self {
            CtError::Unauthorized => StatusCode::UNAUTHORIZED,
            CtError::Forbidden | CtError::PathEscape => StatusCode::FORBIDDEN,
            CtError::NotFound(_) => StatusCode::NOT_FOUND,
            CtError::Conflict(_) => StatusCode::CONFLICT,
            CtError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal failures get a generic body; their detail stays in the host log
        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "host error".to_string()
        } else {
            self.to_string()
        };
        (status, body).into_response()
    }
}

pub struct HostState {
    service: TransferService,
    logger: Arc<dyn Logger>,
    served: AtomicU64,
}

pub type SharedState = Arc<HostState>;

impl HostState {
    pub fn new(service: TransferService, logger: Arc<dyn Logger>) -> Self {
        Self {
            service,
            logger,
            served: AtomicU64::new(0),
        }
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Log the outcome under a fresh request id and turn it into a response.
    fn finish(
        &self,
        op: &str,
        rel: &str,
        peer: SocketAddr,
        outcome: Result<Response, CtError>,
    ) -> Response {
        self.served.fetch_add(1, Ordering::Relaxed);
        let id = uuid::Uuid::new_v4().simple().to_string();
        let response = match outcome {
            Ok(resp) => resp,
            Err(e) => {
                match &e {
                    CtError::PathEscape => self.logger.escape(op, rel, peer),
                    CtError::Io(io) => self.logger.error(op, rel, &io.to_string()),
                    _ => {}
                }
                e.into_response()
            }
        };
        self.logger.request(&id, op, rel, peer, response.status().as_u16());
        response
    }
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    #[serde(default)]
    path: String,
    #[serde(default)]
    filename: String,
}

fn header_value<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Runs before every matched route; unauthenticated requests never reach a handler.
async fn require_auth(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let allowed = match (
        header_value(&req, TOKEN_HEADER),
        header_value(&req, PASSWORD_HEADER),
    ) {
        (Some(t), Some(p)) if !t.is_empty() => auth::authorize(state.service.config(), t, p),
        _ => false,
    };
    if !allowed {
        state.logger.denied(req.uri().path(), peer);
        return CtError::Unauthorized.into_response();
    }
    next.run(req).await
}

async fn list(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(q): Query<PathQuery>,
) -> Response {
    let outcome = state
        .service
        .list(&q.path)
        .await
        .map(|entries| Json(entries).into_response());
    state.finish("list", &q.path, peer, outcome)
}

async fn download(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(q): Query<PathQuery>,
) -> Response {
    let outcome = state.service.open_download(&q.path).await.map(|(file, len)| {
        let body = Body::from_stream(ReaderStream::with_capacity(file, CHUNK_SIZE));
        (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_LENGTH, len.to_string()),
            ],
            body,
        )
            .into_response()
    });
    state.finish("download", &q.path, peer, outcome)
}

async fn upload(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> Response {
    let outcome = state
        .service
        .upload(&q.path, &q.filename, &body)
        .await
        .map(|_| StatusCode::CREATED.into_response());
    let rel = format!("{}/{}", q.path.trim_end_matches('/'), q.filename);
    state.finish("upload", &rel, peer, outcome)
}

async fn mkdir(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(q): Query<PathQuery>,
) -> Response {
    let outcome = state
        .service
        .mkdir(&q.path)
        .await
        .map(|_| StatusCode::CREATED.into_response());
    state.finish("mkdir", &q.path, peer, outcome)
}

async fn remove(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(q): Query<PathQuery>,
) -> Response {
    let outcome = state
        .service
        .delete(&q.path)
        .await
        .map(|_| StatusCode::OK.into_response());
    state.finish("delete", &q.path, peer, outcome)
}

async fn run(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<RunRequest>,
) -> Response {
    let outcome = state
        .service
        .run(&req.command)
        .await
        .map(|out| Json(out).into_response());
    state.finish("run", "", peer, outcome)
}

fn with_auth(routes: Router<SharedState>, state: SharedState) -> Router {
    routes
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Transfer routes; `/run` only when the host opted into execution.
pub fn router(state: SharedState) -> Router {
    let mut routes = Router::new()
        .route(endpoint::LIST, get(list))
        .route(endpoint::DOWNLOAD, get(download))
        .route(endpoint::UPLOAD, post(upload))
        .route(endpoint::MKDIR, post(mkdir))
        .route(endpoint::DELETE, delete(remove));
    if state.service.config().exec_allowed {
        routes = routes.route(endpoint::RUN, post(run));
    }
    with_auth(routes, state)
}

/// Execution-only routes served by the secondary listener.
pub fn exec_router(state: SharedState) -> Router {
    with_auth(Router::new().route(endpoint::RUN, post(run)), state)
}

#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    pub bind: IpAddr,
    /// UDP port for the discovery responder; `None` disables it
    pub discovery_port: Option<u16>,
}

async fn serve_router<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("host stopped with error")
}

/// Run the host until `shutdown` resolves. New connections stop being
/// accepted at that point; in-flight requests finish.
pub async fn serve<F>(
    config: HostConfig,
    opts: ServeOptions,
    logger: Arc<dyn Logger>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = Arc::new(config);
    let addr = SocketAddr::new(opts.bind, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;

    let responder = match opts.discovery_port {
        Some(port) => {
            let socket = discovery::bind_responder(SocketAddr::new(opts.bind, port)).await?;
            let announcement = config.announcement(config::local_ip(opts.bind));
            Some(tokio::spawn(discovery::respond(
                socket,
                announcement,
                logger.clone(),
            )))
        }
        None => None,
    };

    logger.start(
        &config.sandbox_root,
        addr,
        config.write_allowed,
        config.exec_allowed,
    );
    let started = Instant::now();
    let state = Arc::new(HostState::new(
        TransferService::new(config),
        logger.clone(),
    ));
    let result = serve_router(listener, router(state.clone()), shutdown).await;

    if let Some(task) = responder {
        task.abort();
    }
    logger.stop(state.served(), started.elapsed().as_secs_f64());
    result
}

/// Serve only `/run` on `addr`, authenticated with `config`'s credentials.
pub async fn serve_exec<F>(
    config: HostConfig,
    addr: SocketAddr,
    logger: Arc<dyn Logger>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    logger.start(&config.sandbox_root, addr, false, true);
    let started = Instant::now();
    let state = Arc::new(HostState::new(
        TransferService::new(Arc::new(config)),
        logger.clone(),
    ));
    let result = serve_router(listener, exec_router(state.clone()), shutdown).await;
    logger.stop(state.served(), started.elapsed().as_secs_f64());
    result
}
