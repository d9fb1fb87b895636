use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{MethodRouter, get},
};
use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{config::ConfigStore, providers::traits::Service, task_manager::TaskManager};

pub const DASHBOARD_PAGE: &str = "dashboard_all.html.gz";
pub const SETUP_PAGE: &str = "setup_all.html.gz";

/// REST resource mounted at one path.
///
/// Bodies arrive as JSON objects; an empty request body is an empty object.
/// Methods a resource does not override answer `405 Method Not Allowed`.
#[async_trait]
pub trait Resource: Send + Sync {
    async fn get(&self) -> Response {
        method_not_allowed()
    }

    async fn post(&self, _body: Map<String, Value>) -> Response {
        method_not_allowed()
    }

    async fn put(&self, _body: Map<String, Value>) -> Response {
        method_not_allowed()
    }
}

/// `{"message": ...}` JSON response.
pub fn message_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "message": message.into() }))).into_response()
}

fn method_not_allowed() -> Response {
    message_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

fn parse_body(body: &[u8]) -> Result<Map<String, Value>, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(message_response(
            StatusCode::BAD_REQUEST,
            "Request body must be a JSON object",
        )),
        Err(e) => Err(message_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid JSON: {e}"),
        )),
    }
}

fn resource_router(resource: Arc<dyn Resource>) -> MethodRouter {
    let on_get = resource.clone();
    let on_post = resource.clone();
    let on_put = resource;

    get(move || {
        let resource = on_get.clone();
        async move { resource.get().await }
    })
    .post(move |body: Bytes| {
        let resource = on_post.clone();
        async move {
            match parse_body(&body) {
                Ok(map) => resource.post(map).await,
                Err(response) => response,
            }
        }
    })
    .put(move |body: Bytes| {
        let resource = on_put.clone();
        async move {
            match parse_body(&body) {
                Ok(map) => resource.put(map).await,
                Err(response) => response,
            }
        }
    })
}

/// `GET /`: dashboard once the device is set up, setup page before.
pub fn index_route(config: ConfigStore) -> MethodRouter {
    get(move || {
        let target = if config.configured() { "/dashboard" } else { "/setup" };
        async move { (StatusCode::FOUND, [(header::LOCATION, target)]).into_response() }
    })
}

/// Serves a pre-compressed HTML page from disk.
pub fn gzip_page_route(path: PathBuf) -> MethodRouter {
    get(move || {
        let path = path.clone();
        async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => (
                    [
                        (header::CONTENT_TYPE, "text/html"),
                        (header::CONTENT_ENCODING, "gzip"),
                    ],
                    bytes,
                )
                    .into_response(),
                Err(e) => {
                    warn!("Static page {} unavailable: {e}", path.display());
                    message_response(StatusCode::NOT_FOUND, "Not found")
                }
            }
        }
    })
}

/// HTTP server service.
///
/// Resources and routes are collected during construction and turned into
/// an axum [`Router`] when the service runs; the registry is sealed from
/// then on. Binding the listen socket happens inside `run`, so a port
/// conflict fails startup.
///
/// # Example
///
/// ```no_run
/// use neopixeld::config::ConfigStore;
/// use neopixeld::providers::web::{WebServer, index_route};
///
/// let config = ConfigStore::new();
/// let server = WebServer::new(([0, 0, 0, 0], 8080).into());
/// server.add_route("/", index_route(config))?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct WebServer {
    addr: SocketAddr,
    routes: Mutex<Vec<(String, MethodRouter)>>,
    sealed: AtomicBool,
    token: CancellationToken,
}

impl WebServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            routes: Mutex::new(Vec::new()),
            sealed: AtomicBool::new(false),
            token: CancellationToken::new(),
        }
    }

    /// Mounts `resource` at `path` for GET, POST and PUT.
    pub fn add_resource(&self, path: &str, resource: Arc<dyn Resource>) -> Result<()> {
        self.add_route(path, resource_router(resource))
    }

    pub fn add_route(&self, path: &str, route: MethodRouter) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            bail!("Cannot add route {path}: web server already running");
        }
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| anyhow!("Route registry poisoned"))?;
        if routes.iter().any(|(p, _)| p == path) {
            bail!("Route {path} registered twice");
        }
        debug!("Registered route {path}");
        routes.push((path.to_string(), route));
        Ok(())
    }

    /// Router with every registered route.
    pub fn router(&self) -> Result<Router> {
        let routes = self
            .routes
            .lock()
            .map_err(|_| anyhow!("Route registry poisoned"))?;
        Ok(routes
            .iter()
            .fold(Router::new(), |router, (path, route)| router.route(path, route.clone())))
    }
}

#[async_trait]
impl Service for WebServer {
    fn name(&self) -> &'static str {
        "WebServer"
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn run(&self, task_manager: &mut TaskManager) -> Result<()> {
        self.sealed.store(true, Ordering::Release);
        let app = self.router()?;
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind HTTP server on {}", self.addr))?;
        info!("HTTP server listening on {}", self.addr);

        let token = self.token.clone();
        task_manager.spawn_task(self.name(), move |loop_token| async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    tokio::select! {
                        () = token.cancelled() => {}
                        () = loop_token.cancelled() => {}
                    }
                })
                .await
                .context("HTTP server failed")
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}
