//! JSON-RPC method filter
//!
//! Sits in front of a JSON-RPC node and forwards only calls whose `method`
//! passes the configured list. Patterns are regular expressions matched
//! anywhere in the method name, so `^eth_` and `eth_call` both work.
//! Rejected calls are answered here with a JSON-RPC error and never reach
//! the node.

use crate::error::{GateError, GateResult};
use crate::filter::FilterEnv;
use crate::pool::{ConnectionPool, PoolConfig, ProxyBody};
use crate::proxy::{ForwardTarget, ProxyHandler};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use regex::Regex;
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_ALLOWED: i64 = -32601;
/// Allowed entry of a batch that was rejected because of another entry
pub const BATCH_REJECTED: i64 = -32000;

/// Largest POST body inspected, unless the `max_body_bytes` option says otherwise
pub const DEFAULT_BODY_LIMIT: usize = 5 * 1024 * 1024;

/// Whether the method list names what passes or what is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Allow,
    Deny,
}

/// Outcome of inspecting one request body
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Forward,
    Reject(Value),
}

/// Compiled method list
#[derive(Debug, Clone)]
pub struct MethodFilter {
    mode: FilterMode,
    patterns: Vec<Regex>,
}

impl MethodFilter {
    /// Compile `methods`. Blank entries are skipped, they would match every method.
    pub fn new<S: AsRef<str>>(mode: FilterMode, methods: &[S]) -> GateResult<Self> {
        let patterns = methods
            .iter()
            .map(AsRef::as_ref)
            .filter(|m| {
                let blank = m.trim().is_empty();
                if blank {
                    warn!("Ignoring blank method pattern");
                }
                !blank
            })
            .map(|m| {
                Regex::new(m).map_err(|e| {
                    GateError::Configuration(format!("invalid method pattern '{}': {}", m, e))
                })
            })
            .collect::<GateResult<Vec<_>>>()?;
        Ok(Self { mode, patterns })
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn permits(&self, method: &str) -> bool {
        let listed = self.patterns.iter().any(|p| p.is_match(method));
        match self.mode {
            FilterMode::Allow => listed,
            FilterMode::Deny => !listed,
        }
    }

    fn permits_call(&self, call: &Value) -> bool {
        call.get("method")
            .and_then(Value::as_str)
            .is_some_and(|m| self.permits(m))
    }

    pub fn inspect(&self, body: &[u8]) -> Verdict {
        let payload: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Unparseable JSON-RPC body");
                return Verdict::Reject(error_reply(&Value::Null, PARSE_ERROR, "Parse error"));
            }
        };

        match &payload {
            Value::Object(_) => {
                if self.permits_call(&payload) {
                    Verdict::Forward
                } else {
                    info!(method = ?payload.get("method"), "Blocked JSON-RPC call");
                    Verdict::Reject(error_reply(call_id(&payload), METHOD_NOT_ALLOWED, "Method not allowed"))
                }
            }
            Value::Array(calls) if !calls.is_empty() => {
                if calls.iter().all(|c| self.permits_call(c)) {
                    return Verdict::Forward;
                }
                let replies = calls
                    .iter()
                    .map(|call| {
                        if self.permits_call(call) {
                            error_reply(call_id(call), BATCH_REJECTED, "Batch contains a method that is not allowed")
                        } else {
                            info!(method = ?call.get("method"), "Blocked JSON-RPC call in batch");
                            error_reply(call_id(call), METHOD_NOT_ALLOWED, "Method not allowed")
                        }
                    })
                    .collect();
                Verdict::Reject(Value::Array(replies))
            }
            _ => Verdict::Reject(error_reply(&Value::Null, INVALID_REQUEST, "Invalid Request")),
        }
    }
}

fn call_id(call: &Value) -> &Value {
    call.get("id").unwrap_or(&Value::Null)
}

fn error_reply(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

/// Filter server bound to one loopback port, forwarding to one upstream
pub struct JsonRpcFilter {
    listen_port: u16,
    filter: Arc<MethodFilter>,
    handler: ProxyHandler,
    body_limit: usize,
}

impl JsonRpcFilter {
    pub fn new(listen_port: u16, filter: MethodFilter, upstream: ForwardTarget) -> Self {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        Self {
            listen_port,
            filter: Arc::new(filter),
            handler: ProxyHandler::new(upstream, pool),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Methods come from the `methods` option when set, else from the positional args
    pub fn from_env(mode: FilterMode, env: &FilterEnv) -> anyhow::Result<Self> {
        let methods: Vec<String> = match env.options.get("methods") {
            Some(Value::Array(items)) => items.iter().filter_map(|m| m.as_str().map(String::from)).collect(),
            Some(other) => anyhow::bail!("'methods' option must be a list, got {}", other),
            None => env.args.clone(),
        };
        if methods.is_empty() && mode == FilterMode::Allow {
            warn!("Whitelist filter has no methods, every call will be rejected");
        }

        let filter = MethodFilter::new(mode, &methods)?;
        let upstream = ForwardTarget::new(env.upstream_host.clone(), env.upstream_port, "/");
        let body_limit = match env.options.get("max_body_bytes") {
            Some(value) => value
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| anyhow::anyhow!("'max_body_bytes' option must be a positive integer, got {}", value))?,
            None => DEFAULT_BODY_LIMIT,
        };
        Ok(Self::new(env.listen_port, filter, upstream).with_body_limit(body_limit))
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.listen_port));
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %addr,
            upstream = %self.handler.target(),
            mode = ?self.filter.mode(),
            "JSON-RPC filter listening"
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let filter = Arc::clone(&self.filter);
                            let handler = self.handler.clone();
                            let body_limit = self.body_limit;
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    handle_request(req, Arc::clone(&filter), handler.clone(), body_limit)
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
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
                        info!("JSON-RPC filter shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    filter: Arc<MethodFilter>,
    handler: ProxyHandler,
    body_limit: usize,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let path = req.uri().path().to_string();

    if req.method() != Method::POST {
        return Ok(handler.handle(req.map(|b| b.boxed()), Some(&path)).await);
    }

    let (parts, body) = req.into_parts();
    let bytes = match read_body(body, body_limit).await {
        Ok(bytes) => bytes,
        Err(reply) => return Ok(reply),
    };

    match filter.inspect(&bytes) {
        Verdict::Forward => {
            let req = Request::from_parts(parts, full(bytes));
            Ok(handler.handle(req, Some(&path)).await)
        }
        Verdict::Reject(reply) => Ok(json_reply(StatusCode::OK, &reply)),
    }
}

/// Collect a request body of at most `limit` bytes.
///
/// Oversized or broken bodies come back as the JSON-RPC error response to send.
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, Response<ProxyBody>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => {
            warn!(limit, "JSON-RPC request body too large");
            Err(json_reply(
                StatusCode::PAYLOAD_TOO_LARGE,
                &error_reply(&Value::Null, INVALID_REQUEST, "Request body too large"),
            ))
        }
        Err(e) => {
            debug!(error = %e, "Failed to read JSON-RPC request body");
            Err(json_reply(
                StatusCode::BAD_REQUEST,
                &error_reply(&Value::Null, PARSE_ERROR, "Parse error"),
            ))
        }
    }
}

fn json_reply(status: StatusCode, reply: &Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(Bytes::from(reply.to_string())))
        .expect("valid response with static headers")
}

fn full(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
