//! Connectivity probing and best-effort host address discovery.

use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Loopback sentinel reported when host address lookup fails.
pub const LOOPBACK_SENTINEL: &str = "127.0.0.1";

/// Probe whether the collector host accepts TCP connections.
///
/// True only on a completed handshake within the timeout; resolution
/// failure, refusal and timeout all read as unreachable. Resolution and
/// connect are each bounded, and the probe socket is dropped on return.
pub async fn is_reachable(host: &str, port: u16, probe_timeout: Duration) -> bool {
    let endpoint = format!("{host}:{port}");

    let resolved = match timeout(probe_timeout, lookup_host(&endpoint)).await {
        Ok(Ok(mut addrs)) => addrs.next(),
        Ok(Err(e)) => {
            debug!(endpoint, "probe resolution failed: {e}");
            return false;
        }
        Err(_) => {
            debug!(endpoint, "probe resolution timed out");
            return false;
        }
    };

    let Some(addr) = resolved else {
        debug!(endpoint, "probe resolved no addresses");
        return false;
    };

    match timeout(probe_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(endpoint, "probe connect failed: {e}");
            false
        }
        Err(_) => {
            debug!(endpoint, "probe connect timed out");
            false
        }
    }
}

/// Best-effort address of the host this service runs on.
///
/// Connecting a UDP socket to a non-routable address selects the outbound
/// interface without sending any traffic. Any failure degrades to
/// [`LOOPBACK_SENTINEL`]; this lookup never aborts a cycle.
pub fn local_ip() -> String {
    let Ok(socket) = std::net::UdpSocket::bind(("0.0.0.0", 0)) else {
        return LOOPBACK_SENTINEL.to_string();
    };
    if socket.connect(("10.254.254.254", 1)).is_err() {
        return LOOPBACK_SENTINEL.to_string();
    }
    socket
        .local_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| LOOPBACK_SENTINEL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn listening_socket_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_reachable("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_reachable("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn unresolvable_host_is_unreachable() {
        assert!(!is_reachable("host.invalid", 80, Duration::from_millis(500)).await);
    }

    #[test]
    fn local_ip_is_always_a_parseable_address() {
        let address = local_ip();
        assert!(address.parse::<std::net::IpAddr>().is_ok());
    }
}
