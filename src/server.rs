//! Public HTTP server
//!
//! Serves the built-in `/info`, `/files` and `/solved` endpoints and every
//! declared mapping from one listener. Routes are fixed before the listener is
//! bound; nothing is answered until the challenge is marked ready.

use crate::challenge::{ChallengeDefinition, FlagType, SolveTracker};
use crate::error::{json_error_response, GateErrorCode};
use crate::pool::ProxyBody;
use crate::router::{RouteAction, RouteMatch, RouteTable};
use crate::state::ChallengeState;
use crate::template::dedent;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Everything request handlers share
pub struct Gateway {
    pub challenge: ChallengeDefinition,
    pub state: ChallengeState,
    pub routes: RouteTable,
    pub solves: Arc<SolveTracker>,
    /// Revealed by `/solved` for dynamic challenges
    pub flag: String,
    ready: AtomicBool,
}

impl Gateway {
    pub fn new(
        challenge: ChallengeDefinition,
        state: ChallengeState,
        routes: RouteTable,
        solves: Arc<SolveTracker>,
        flag: impl Into<String>,
    ) -> Self {
        Self {
            challenge,
            state,
            routes,
            solves,
            flag: flag.into(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
        info!(ready, "Challenge readiness changed");
    }

    /// Route and answer one request
    pub async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        if !self.is_ready() {
            return json_error_response(GateErrorCode::NotReady, "Challenge is not ready");
        }

        let path = req.uri().path().to_string();
        match self.routes.lookup(req.method(), &path) {
            RouteMatch::Found { route, captured } => match &route.action {
                RouteAction::Info => self.info().await,
                RouteAction::Files => self.files().await,
                RouteAction::Solved => self.solved().await,
                RouteAction::Proxy(handler) => handler.handle(req, captured.as_deref()).await,
            },
            RouteMatch::MethodNotAllowed => json_error_response(
                GateErrorCode::MethodNotAllowed,
                format!("Method {} not allowed for {}", req.method(), path),
            ),
            RouteMatch::NotFound => json_error_response(GateErrorCode::NotFound, format!("No route for {}", path)),
        }
    }

    async fn info(&self) -> Response<ProxyBody> {
        let details = self.challenge.details().and_then(|provider| {
            match provider.details(&self.state) {
                Ok(text) => Some(dedent(&text).trim().to_string()),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Failed to produce challenge details");
                    None
                }
            }
        });

        json_response(
            StatusCode::OK,
            &json!({
                "ready": self.is_ready(),
                "state": self.state.public.snapshot(),
                "details": details,
            }),
        )
    }

    async fn files(&self) -> Response<ProxyBody> {
        let Some(provider) = self.challenge.files() else {
            return json_error_response(GateErrorCode::NotFound, "Challenge has no files");
        };

        match provider.archive().await {
            Ok(bytes) => {
                let disposition = format!("attachment; filename=\"{}\"", self.challenge.archive_name());
                let mut response = Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, "application/zip")
                    .body(full(Bytes::from(bytes)))
                    .expect("valid response with static headers");
                match HeaderValue::from_str(&disposition) {
                    Ok(value) => {
                        response.headers_mut().insert(CONTENT_DISPOSITION, value);
                    }
                    Err(e) => warn!(error = %e, "Archive name is not a valid header value"),
                }
                response
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to read challenge files");
                json_error_response(GateErrorCode::InternalError, "Could not read challenge files")
            }
        }
    }

    async fn solved(&self) -> Response<ProxyBody> {
        let Some(solver) = self.challenge.solver() else {
            return json_error_response(GateErrorCode::NotFound, "Challenge has no solver");
        };

        let status = self.solves.check(solver.as_ref(), &self.state).await;
        let mut body = json!({
            "solved": status.solved,
            "msg": status.message(),
        });
        if status.solved && self.challenge.flag_type == FlagType::Dynamic {
            body["flag"] = Value::String(self.flag.clone());
        }

        json_response(StatusCode::OK, &body)
    }
}

fn full(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn json_response(status: StatusCode, body: &Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static headers")
}

/// Listener plus the accept loop
pub struct GatewayServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            gateway,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, routes = self.gateway.routes.len(), "Challenge server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, gateway).await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Challenge server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(gateway.handle(req.map(|b| b.boxed())).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
