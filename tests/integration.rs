//! Integration tests for ctfgate: gateway, proxying and filters in process

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backend::{echo_backend, redirect_backend, streaming_backend};
use ctfgate::challenge::{
    Capabilities, ChallengeDefinition, ChallengePhases, FlagType, Solver, SolverVerdict,
};
use ctfgate::filter::FilterSpec;
use ctfgate::phase::{ControllerConfig, PhaseContext, PhaseController, PhaseState, RunningChallenge};
use ctfgate::router::MappingConfig;
use ctfgate::state::ChallengeState;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Minimal HTTP backends the gateway proxies to
mod backend {
    use super::*;
    use http_body_util::combinators::BoxBody;
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Body, Bytes, Frame, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, Notify};

    type BackendBody = BoxBody<Bytes, Infallible>;

    /// Serve `handler` on a fresh port, returning the port and a request counter
    async fn serve<F, Fut>(handler: F) -> (u16, Arc<AtomicUsize>)
    where
        F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Response<BackendBody>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let counter = Arc::clone(&counter);
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let response = handler(req);
                        async move { Ok::<_, Infallible>(response.await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (port, hits)
    }

    fn full(body: impl Into<Bytes>) -> BackendBody {
        Full::new(body.into()).boxed()
    }

    /// Start a backend that answers every request with its body and path.
    pub async fn echo_backend() -> (u16, Arc<AtomicUsize>) {
        serve(|req: Request<Incoming>| async move {
            let path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();
            let method = req.method().to_string();
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Response::builder()
                .header("X-Backend-Path", path)
                .header("X-Backend-Method", method)
                .body(full(body))
                .unwrap()
        })
        .await
    }

    /// Start a backend that redirects every request to `/login`
    pub async fn redirect_backend() -> (u16, Arc<AtomicUsize>) {
        serve(|_req: Request<Incoming>| async move {
            Response::builder()
                .status(StatusCode::FOUND)
                .header("Location", "/login")
                .body(full("moved"))
                .unwrap()
        })
        .await
    }

    /// Body fed chunk by chunk from a channel
    struct ChannelBody(mpsc::Receiver<Bytes>);

    impl Body for ChannelBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            self.get_mut()
                .0
                .poll_recv(cx)
                .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
        }
    }

    /// Start a backend that sends `chunk` bytes of `x`, waits for `release`,
    /// then sends `chunk` bytes of `z` and ends the body.
    pub async fn streaming_backend(chunk: usize, release: Arc<Notify>) -> (u16, Arc<AtomicUsize>) {
        serve(move |_req: Request<Incoming>| {
            let release = Arc::clone(&release);
            async move {
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(async move {
                    let _ = tx.send(Bytes::from(vec![b'x'; chunk])).await;
                    release.notified().await;
                    let _ = tx.send(Bytes::from(vec![b'z'; chunk])).await;
                });
                Response::new(ChannelBody(rx).boxed())
            }
        })
        .await
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct NoopPhases;

#[async_trait]
impl ChallengePhases for NoopPhases {
    async fn build(&self, _ctx: &PhaseContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, _ctx: &PhaseContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Solved once the `done` state key is set
struct FlagKeySolver;

#[async_trait]
impl Solver for FlagKeySolver {
    async fn check(&self, state: &ChallengeState) -> anyhow::Result<SolverVerdict> {
        match state.lookup("done") {
            Some(Value::Bool(true)) => Ok(SolverVerdict::solved("nice")),
            _ => Ok(SolverVerdict::unsolved()),
        }
    }
}

fn controller_config(state_dir: PathBuf) -> ControllerConfig {
    ControllerConfig {
        state_dir,
        isolate_group: false,
        grace_period: Duration::from_secs(1),
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        flag: "HAL{X}".to_string(),
        filter_exe: Some(PathBuf::from(env!("CARGO_BIN_EXE_ctfgate"))),
        ..ControllerConfig::default()
    }
}

/// Build then start a challenge, returning the running instance
async fn start(definition: ChallengeDefinition, state_dir: PathBuf) -> (PhaseController, RunningChallenge) {
    let mut controller = PhaseController::new(definition, controller_config(state_dir));
    controller.build().await.unwrap();
    let running = controller.start().await.unwrap();
    assert_eq!(controller.phase_state(), PhaseState::Ready);
    (controller, running)
}

/// Send a raw HTTP request and return the full response text
async fn http_request(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        addr,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

/// Occurrences of `byte` after the response head
fn body_count(response: &[u8], byte: u8) -> usize {
    response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|end| response[end + 4..].iter().filter(|&&b| b == byte).count())
        .unwrap_or(0)
}

fn json_body(response: &str) -> Value {
    serde_json::from_str(body_of(response)).unwrap()
}

// ============================================================================
// Proxying
// ============================================================================

#[tokio::test]
async fn test_post_forwarded_with_identical_body() {
    let (backend_port, hits) = echo_backend().await;
    let dir = tempfile::tempdir().unwrap();

    let definition = ChallengeDefinition::builder("Echo", NoopPhases)
        .flag_type(FlagType::Static)
        .mapping(MappingConfig::new("/", backend_port).with_methods(["POST"]))
        .build()
        .unwrap();
    let (_controller, running) = start(definition, dir.path().to_path_buf()).await;

    let payload = r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId"}"#;
    let response = http_request(running.local_addr(), "POST", "/", payload).await;

    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), payload);
    assert!(response.to_lowercase().contains("x-backend-path: /"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // GET is not declared for the mapping
    let response = http_request(running.local_addr(), "GET", "/", "").await;
    assert_eq!(status_of(&response), 405);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_catch_all_route_joins_base_path() {
    let (backend_port, _hits) = echo_backend().await;
    let dir = tempfile::tempdir().unwrap();

    let definition = ChallengeDefinition::builder("Paths", NoopPhases)
        .flag_type(FlagType::Static)
        .mapping(
            MappingConfig::new("/api/<path:rest>", backend_port)
                .with_path("/service")
                .with_methods(["GET", "POST"]),
        )
        .build()
        .unwrap();
    let (_controller, running) = start(definition, dir.path().to_path_buf()).await;

    let response = http_request(running.local_addr(), "GET", "/api/users/7?full=1", "").await;
    assert_eq!(status_of(&response), 200);
    assert!(response
        .to_lowercase()
        .contains("x-backend-path: /service/users/7?full=1"));

    let response = http_request(running.local_addr(), "GET", "/elsewhere", "").await;
    assert_eq!(status_of(&response), 404);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backend_down_returns_503() {
    let dead_port = ctfgate::net::find_free_port().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let definition = ChallengeDefinition::builder("Down", NoopPhases)
        .flag_type(FlagType::Static)
        .mapping(MappingConfig::new("/", dead_port).with_methods(["POST"]))
        .build()
        .unwrap();
    let (_controller, running) = start(definition, dir.path().to_path_buf()).await;

    let response = http_request(running.local_addr(), "POST", "/", "{}").await;
    assert_eq!(status_of(&response), 503);
    let body = json_body(&response);
    assert_eq!(
        body["message"],
        json!(format!("Could not connect with server on port {}", dead_port))
    );

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_redirect_is_relayed_not_followed() {
    let (backend_port, hits) = redirect_backend().await;
    let dir = tempfile::tempdir().unwrap();

    let definition = ChallengeDefinition::builder("Redirect", NoopPhases)
        .flag_type(FlagType::Static)
        .mapping(MappingConfig::new("/", backend_port).with_methods(["GET"]))
        .build()
        .unwrap();
    let (_controller, running) = start(definition, dir.path().to_path_buf()).await;

    let response = http_request(running.local_addr(), "GET", "/", "").await;
    assert_eq!(status_of(&response), 302);
    assert!(response.to_lowercase().contains("location: /login"));
    assert_eq!(body_of(&response), "moved");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_response_body_is_streamed() {
    const CHUNK: usize = 64 * 1024;

    let release = Arc::new(tokio::sync::Notify::new());
    let (backend_port, _hits) = streaming_backend(CHUNK, Arc::clone(&release)).await;
    let dir = tempfile::tempdir().unwrap();

    let definition = ChallengeDefinition::builder("Stream", NoopPhases)
        .flag_type(FlagType::Static)
        .mapping(MappingConfig::new("/", backend_port).with_methods(["GET"]))
        .build()
        .unwrap();
    let (_controller, running) = start(definition, dir.path().to_path_buf()).await;

    let addr = running.local_addr();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", addr);
    stream.write_all(request.as_bytes()).await.unwrap();

    // The first chunk must reach the client while the backend is still holding the rest
    let mut received = Vec::new();
    let first_chunk = tokio::time::timeout(Duration::from_secs(10), async {
        let mut buf = [0u8; 8192];
        while body_count(&received, b'x') < CHUNK {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the first chunk arrived");
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await;
    assert!(first_chunk.is_ok(), "gateway buffered the response body");
    assert_eq!(body_count(&received, b'z'), 0);

    release.notify_one();
    stream.read_to_end(&mut received).await.unwrap();

    let response = String::from_utf8_lossy(&received);
    assert_eq!(status_of(&response), 200);
    assert!(response.to_lowercase().contains("transfer-encoding: chunked"));
    assert_eq!(body_count(&received, b'x'), CHUNK);
    assert_eq!(body_count(&received, b'z'), CHUNK);
    assert!(response.ends_with("0\r\n\r\n"));

    running.shutdown().await.unwrap();
}

// ============================================================================
// Built-in endpoints
// ============================================================================

#[tokio::test]
async fn test_solved_reveals_dynamic_flag_after_ready() {
    let dir = tempfile::tempdir().unwrap();

    let definition = ChallengeDefinition::builder("Flagged", NoopPhases)
        .flag_type(FlagType::Dynamic)
        .capabilities(Capabilities {
            solver: true,
            ..Capabilities::default()
        })
        .solver(FlagKeySolver)
        .build()
        .unwrap();
    let (controller, running) = start(definition, dir.path().to_path_buf()).await;

    let response = http_request(running.local_addr(), "GET", "/solved", "").await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(json_body(&response), json!({"solved": false, "msg": "Not solved"}));

    controller.state().private.write().set("done", true);
    let response = http_request(running.local_addr(), "GET", "/solved", "").await;
    assert_eq!(
        json_body(&response),
        json!({"solved": true, "msg": "nice", "flag": "HAL{X}"})
    );

    // Solved stays solved even if the condition no longer holds
    controller.state().private.write().set("done", false);
    let response = http_request(running.local_addr(), "GET", "/solved", "").await;
    assert_eq!(json_body(&response)["solved"], json!(true));

    // Not ready again once shutdown starts
    running.gateway().set_ready(false);
    let response = http_request(running.local_addr(), "GET", "/solved", "").await;
    assert_eq!(status_of(&response), 503);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_info_shows_only_public_state() {
    struct SeedPhases;

    #[async_trait]
    impl ChallengePhases for SeedPhases {
        async fn build(&self, ctx: &PhaseContext) -> anyhow::Result<()> {
            ctx.state().private.write().set("private_key", "0xsecret");
            ctx.state().public.write().set("rpc", "/");
            Ok(())
        }

        async fn run(&self, _ctx: &PhaseContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let definition = ChallengeDefinition::builder("Info", SeedPhases)
        .flag_type(FlagType::Static)
        .build()
        .unwrap();
    let (_controller, running) = start(definition, dir.path().to_path_buf()).await;

    let response = http_request(running.local_addr(), "GET", "/info", "").await;
    assert_eq!(status_of(&response), 200);
    let body = json_body(&response);
    assert_eq!(body["ready"], json!(true));
    assert_eq!(body["state"], json!({"rpc": "/"}));
    assert!(!body_of(&response).contains("0xsecret"));

    // Not a solver challenge
    let response = http_request(running.local_addr(), "GET", "/solved", "").await;
    assert_eq!(status_of(&response), 404);

    running.shutdown().await.unwrap();
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test]
async fn test_jsonrpc_whitelist_filter_in_front_of_backend() {
    let (backend_port, hits) = echo_backend().await;
    let dir = tempfile::tempdir().unwrap();

    let mut spec = FilterSpec::new("builtin:jsonrpc-whitelist").with_args(["^eth_", "^net_version$"]);
    spec.ready_timeout_ms = Some(10_000);

    let definition = ChallengeDefinition::builder("Filtered", NoopPhases)
        .flag_type(FlagType::Static)
        .mapping(
            MappingConfig::new("/", backend_port)
                .with_methods(["POST"])
                .with_filter(spec),
        )
        .build()
        .unwrap();
    let (_controller, running) = start(definition, dir.path().to_path_buf()).await;

    let filter_port = running.routes()[0].filter_port.unwrap();
    assert!(ctfgate::net::wait_for_port("127.0.0.1", filter_port, Duration::from_secs(10)).await);
    assert!(running.context().filters().is_running(filter_port));

    let allowed = r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber"}"#;
    let response = http_request(running.local_addr(), "POST", "/", allowed).await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), allowed);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let denied = r#"{"jsonrpc":"2.0","id":2,"method":"anvil_setBalance"}"#;
    let response = http_request(running.local_addr(), "POST", "/", denied).await;
    assert_eq!(status_of(&response), 200);
    let body = json_body(&response);
    assert_eq!(body["id"], json!(2));
    assert_eq!(body["error"]["code"], json!(-32601));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    running.shutdown().await.unwrap();
    assert!(!ctfgate::net::wait_for_port("127.0.0.1", filter_port, Duration::from_millis(200)).await);
}
