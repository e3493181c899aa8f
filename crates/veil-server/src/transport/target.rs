//! Outbound TCP dial to the endpoint named in a handshake.

use socket2::SockRef;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;
use veil_core::{TargetAddr, VeilError, VeilResult};

/// Connect to `target:port` within `limit`, then tune the socket for
/// interactive traffic (no Nagle, keep-alive on).
pub async fn dial(target: &TargetAddr, port: u16, limit: Duration) -> VeilResult<TcpStream> {
    let connect = async {
        match target {
            TargetAddr::Ipv4(ip) => TcpStream::connect(SocketAddr::new((*ip).into(), port)).await,
            TargetAddr::Ipv6(ip) => TcpStream::connect(SocketAddr::new((*ip).into(), port)).await,
            TargetAddr::Domain(name) => TcpStream::connect((name.as_str(), port)).await,
        }
    };

    let stream = tokio::time::timeout(limit, connect)
        .await
        .map_err(|_| VeilError::Timeout)?
        .map_err(|e| VeilError::Transport(format!("connect {target}:{port} failed: {e}")))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
        debug!(error = %e, "set_keepalive failed");
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_and_tunes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = dial(
            &TargetAddr::Ipv4(Ipv4Addr::LOCALHOST),
            port,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn refused_connect_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = dial(
            &TargetAddr::Ipv4(Ipv4Addr::LOCALHOST),
            port,
            Duration::from_secs(2),
        )
        .await;
        assert!(result.is_err());
    }
}
