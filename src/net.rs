//! Port allocation and readiness polling

use crate::error::{GateError, GateResult};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Interval between connection attempts in [`wait_for_port`]
const PORT_POLL_INTERVAL_MS: u64 = 10;

/// Find a free TCP port on the loopback interface.
///
/// The port is verified by binding a throwaway socket, which is released
/// before returning so the caller's process can bind it.
pub fn find_free_port() -> GateResult<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .map_err(GateError::ResourceExhausted)?;
    let port = listener
        .local_addr()
        .map_err(GateError::ResourceExhausted)?
        .port();
    drop(listener);
    debug!(port, "Allocated free port");
    Ok(port)
}

/// Wait until `host:port` accepts TCP connections.
///
/// Returns `false` if the port is still closed after `timeout`.
pub async fn wait_for_port(host: &str, port: u16, timeout: Duration) -> bool {
    info!(host, port, "Waiting for port");
    let start = Instant::now();
    let addr = format!("{}:{}", host, port);

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {
                info!(host, port, elapsed_ms = start.elapsed().as_millis(), "Port found");
                return true;
            }
            Ok(Err(_)) | Err(_) => {}
        }

        if start.elapsed() >= timeout {
            warn!(
                host,
                port,
                timeout_ms = timeout.as_millis(),
                "Waited too long for port to start accepting connections"
            );
            return false;
        }
        tokio::time::sleep(Duration::from_millis(PORT_POLL_INTERVAL_MS)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port_is_bindable() {
        let port = find_free_port().unwrap();
        assert!(port > 0);
        // Released, so we can bind it ourselves
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_find_free_port_distinct_while_held() {
        let a = find_free_port().unwrap();
        let _held = TcpListener::bind(("127.0.0.1", a)).unwrap();
        let b = find_free_port().unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_wait_for_port_open() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(wait_for_port("127.0.0.1", port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_wait_for_port_closed_times_out() {
        let port = find_free_port().unwrap();
        let start = Instant::now();
        assert!(!wait_for_port("127.0.0.1", port, Duration::from_millis(200)).await);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
