//! Admin HTTP API for operators and panel front-ends

use crate::client_ips::ClientIpState;
use crate::error::{json_error_response, CoreError};
use crate::jobs::Job;
use crate::restart::RestartFlag;
use crate::supervisor::EngineSupervisor;
use anyhow::Context;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Everything the handlers read from or signal to
pub struct AdminContext {
    pub engine: Arc<EngineSupervisor>,
    pub client_ips: Arc<ClientIpState>,
    pub restart_flag: Arc<RestartFlag>,
    pub auth_token: String,
}

/// Admin API listener, run as a critical job
pub struct AdminServer {
    bind_addr: SocketAddr,
    ctx: Arc<AdminContext>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, ctx: AdminContext) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bind_addr,
            ctx: Arc::new(ctx),
            shutdown_tx,
            local_addr: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Address actually bound, available once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl Job for AdminServer {
    fn name(&self) -> &str {
        "admin-api"
    }

    /// Binds synchronously so a taken port fails startup
    fn start(&self) -> anyhow::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            anyhow::bail!("admin server is already started");
        }

        let std_listener = std::net::TcpListener::bind(self.bind_addr)
            .with_context(|| format!("Failed to bind admin API on {}", self.bind_addr))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        info!(addr = %local_addr, "Admin API server listening");
        let ctx = Arc::clone(&self.ctx);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(accept_loop(listener, ctx, shutdown_rx)));
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Admin server task ended abnormally");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<AdminContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, ctx).await {
                                debug!(addr = %addr, error = %e, "Admin connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept admin connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Admin server shutting down");
                    break;
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, ctx: Arc<AdminContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, hyper::Error>(handle_request(&req, &ctx)) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

/// Route one request; only `/health` is served without a token
pub fn handle_request<B>(req: &Request<B>, ctx: &AdminContext) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    if (method, path) == (&Method::GET, "/health") {
        let body = serde_json::json!({
            "status": "ok",
            "name": PKG_NAME,
            "version": VERSION,
        });
        return json_response(StatusCode::OK, body.to_string());
    }

    if !check_auth(req, &ctx.auth_token) {
        warn!(path, "Unauthorized admin API request");
        return response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    match (method, path) {
        (&Method::GET, "/status") => match serde_json::to_string(&ctx.engine.status()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => json_error_response(&CoreError::from(e)),
        },

        (&Method::GET, "/client-ips") => {
            let snapshot = ctx.client_ips.snapshot();
            let body = serde_json::json!({
                "count": snapshot.len(),
                "clients": snapshot,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, "/restart") => {
            ctx.restart_flag.raise();
            info!("Engine restart requested via admin API");
            json_response(StatusCode::ACCEPTED, r#"{"restart":"queued"}"#)
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
