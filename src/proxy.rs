//! Reverse proxy handler for declared mappings
//!
//! Each mapping gets one [`ProxyHandler`] bound to a fixed [`ForwardTarget`].
//! Handlers hold no per-request state; everything they share is the
//! connection pool, so concurrent requests never interfere.

use crate::error::{json_error_response, GateError, GateErrorCode};
use crate::pool::{ConnectionPool, ProxyBody};
use hyper::header::{HeaderName, ACCEPT_ENCODING, HOST};
use hyper::{Request, Response};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Response headers describing the backend's own framing. The proxy reframes the
/// relayed body, so these are never passed through.
pub const HOP_BY_HOP_RESPONSE_HEADERS: [&str; 4] = [
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// Where a mapping forwards its requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl ForwardTarget {
    pub fn new(host: impl Into<String>, port: u16, base_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            base_path: base_path.into(),
        }
    }

    /// Absolute URI for a request whose route captured `suffix`
    pub fn uri_for(&self, suffix: &str, query: Option<&str>) -> String {
        let path = join_path(&self.base_path, suffix);
        match query {
            Some(q) if !q.is_empty() => format!("http://{}:{}{}?{}", self.host, self.port, path, q),
            _ => format!("http://{}:{}{}", self.host, self.port, path),
        }
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}{}", self.host, self.port, self.base_path)
    }
}

/// Join a base path and a captured suffix with exactly one slash between them.
///
/// `("/", "")` gives `/` and `("/service", "a/b")` gives `/service/a/b`,
/// whatever slashes either side already carries.
pub fn join_path(base: &str, suffix: &str) -> String {
    let base = base.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    if base.starts_with('/') || base.is_empty() {
        format!("{}/{}", base, suffix)
    } else {
        format!("/{}/{}", base, suffix)
    }
}

/// True for response headers that must not be relayed
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_RESPONSE_HEADERS.contains(&name.as_str())
}

/// Forwards requests for one mapping to its target
#[derive(Clone)]
pub struct ProxyHandler {
    target: Arc<ForwardTarget>,
    pool: Arc<ConnectionPool>,
}

impl ProxyHandler {
    pub fn new(target: ForwardTarget, pool: Arc<ConnectionPool>) -> Self {
        Self {
            target: Arc::new(target),
            pool,
        }
    }

    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    /// Forward `req` and relay the backend's response.
    ///
    /// Never fails: an unreachable backend becomes a 503 for this request only.
    pub async fn handle(&self, req: Request<ProxyBody>, captured: Option<&str>) -> Response<ProxyBody> {
        let request_id = Uuid::new_v4();
        let start = Instant::now();
        let uri = self
            .target
            .uri_for(captured.unwrap_or(""), req.uri().query());
        let method = req.method().clone();

        debug!(%request_id, %method, inbound = %req.uri(), outbound = %uri, "Forwarding request");

        let outbound = match build_outbound(req, &uri) {
            Ok(r) => r,
            Err(e) => {
                warn!(%request_id, uri = %uri, error = %e, "Failed to build outbound request");
                return json_error_response(GateErrorCode::InternalError, "Invalid forward target");
            }
        };

        match self.pool.send(outbound).await {
            Ok(response) => {
                debug!(
                    %request_id,
                    status = response.status().as_u16(),
                    elapsed_ms = start.elapsed().as_millis(),
                    "Backend responded"
                );
                relay_response(response)
            }
            Err(e) => {
                let err = GateError::BackendUnavailable {
                    port: self.target.port,
                    reason: e.to_string(),
                };
                warn!(
                    %request_id,
                    port = self.target.port,
                    connect = e.is_connect(),
                    error = %e,
                    "Backend unavailable"
                );
                json_error_response(err.error_code(), err.to_string())
            }
        }
    }
}

/// Build the backend request: same method, headers and streamed body, new URI.
///
/// `Host` is dropped so the client sets the backend's own. `Accept-Encoding` is
/// dropped too: relayed responses lose `Content-Encoding`, so the backend must
/// not compress.
fn build_outbound(req: Request<ProxyBody>, uri: &str) -> Result<Request<ProxyBody>, hyper::http::Error> {
    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(uri);

    for (name, value) in parts.headers.iter() {
        if name == HOST || name == ACCEPT_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder.body(body)
}

fn relay_response(response: Response<ProxyBody>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    let framing: Vec<HeaderName> = parts
        .headers
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in framing {
        parts.headers.remove(&name);
    }
    Response::from_parts(parts, body)
}
