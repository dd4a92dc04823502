//! Connection pool for outbound HTTP connections
//!
//! One pooled client is shared by every proxy handler and by the built-in
//! filters, so connections to the same backend are reused across requests.

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Body type used on both sides of the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Outbound request failure
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
}

impl PoolError {
    /// True if the backend could not be reached at all
    pub fn is_connect(&self) -> bool {
        match self {
            PoolError::Client(e) => e.is_connect(),
        }
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Maximum time to establish a backend connection
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A pooled HTTP client for backend connections
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        // Redirects are never followed: the legacy client hands 3xx back as-is
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_ms = config.connect_timeout.as_millis(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Send a fully built request. The request URI must be absolute.
    pub async fn send(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, PoolError> {
        let response = self.client.request(req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
