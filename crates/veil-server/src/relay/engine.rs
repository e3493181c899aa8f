//! Bidirectional relay between a WebSocket and a TCP stream.
//!
//! Each direction runs in its own task. The engine waits for whichever
//! finishes first, signals the other through a `watch` channel, joins it,
//! then closes both channels. Byte counts are owned by their direction and
//! only reported after join.

use crate::transport::websocket::{close_quietly, ws_recv, ws_send_binary, Inbound};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// Which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to target.
    Uplink,
    /// Target to client.
    Downlink,
}

/// How one direction stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectionEnd {
    /// The side it reads from closed cleanly.
    PeerClosed,
    /// Stopped because the other direction finished first.
    Cancelled,
    /// Read or write error.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionReport {
    pub end: DirectionEnd,
    pub bytes: u64,
}

/// Result of a completed relay.
#[derive(Debug, Clone)]
pub struct RelayReport {
    /// The direction that finished on its own.
    pub first: Direction,
    pub uplink: DirectionReport,
    pub downlink: DirectionReport,
}

type WsRx<S> = SplitStream<WebSocketStream<S>>;
type WsTx<S> = SplitSink<WebSocketStream<S>, Message>;

/// Relay until either side ends, then tear both down.
pub async fn relay<S>(ws: WebSocketStream<S>, tcp: TcpStream, buffer_size: usize) -> RelayReport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_tx, ws_rx) = ws.split();
    let (tcp_rx, tcp_tx) = tcp.into_split();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut up: JoinHandle<(DirectionReport, WsRx<S>, OwnedWriteHalf)> =
        tokio::spawn(uplink(ws_rx, tcp_tx, cancel_rx.clone()));
    let mut down: JoinHandle<(DirectionReport, OwnedReadHalf, WsTx<S>)> =
        tokio::spawn(downlink(tcp_rx, ws_tx, cancel_rx, buffer_size));

    let (first, up_res, down_res) = tokio::select! {
        r = &mut up => {
            let _ = cancel_tx.send(true);
            (Direction::Uplink, r, down.await)
        }
        r = &mut down => {
            let _ = cancel_tx.send(true);
            (Direction::Downlink, up.await, r)
        }
    };
    trace!(?first, "relay direction finished first");

    let mut ws_rx = None;
    let mut ws_tx = None;

    let uplink_report = match up_res {
        Ok((report, rx, mut tcp_tx)) => {
            let _ = tcp_tx.shutdown().await;
            ws_rx = Some(rx);
            report
        }
        Err(e) => joined_failure(e),
    };
    let downlink_report = match down_res {
        Ok((report, _tcp_rx, tx)) => {
            ws_tx = Some(tx);
            report
        }
        Err(e) => joined_failure(e),
    };

    if let (Some(rx), Some(tx)) = (ws_rx, ws_tx) {
        if let Ok(mut ws) = rx.reunite(tx) {
            close_quietly(&mut ws).await;
        }
    }

    RelayReport {
        first,
        uplink: uplink_report,
        downlink: downlink_report,
    }
}

fn joined_failure(e: tokio::task::JoinError) -> DirectionReport {
    DirectionReport {
        end: DirectionEnd::Failed(format!("relay task aborted: {e}")),
        bytes: 0,
    }
}

/// WebSocket → TCP. Binary messages are written verbatim; text is ignored.
async fn uplink<S>(
    mut ws_rx: WsRx<S>,
    mut tcp_tx: OwnedWriteHalf,
    mut cancel: watch::Receiver<bool>,
) -> (DirectionReport, WsRx<S>, OwnedWriteHalf)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let end = loop {
        let inbound = tokio::select! {
            _ = cancel.changed() => break DirectionEnd::Cancelled,
            m = ws_recv(&mut ws_rx) => m,
        };
        match inbound {
            Ok(Inbound::Binary(data)) => {
                let len = data.len() as u64;
                tokio::select! {
                    _ = cancel.changed() => break DirectionEnd::Cancelled,
                    r = tcp_tx.write_all(&data) => {
                        if let Err(e) = r {
                            debug!(error = %e, "uplink write failed");
                            break DirectionEnd::Failed(e.to_string());
                        }
                    }
                }
                bytes += len;
            }
            Ok(Inbound::Text) => continue,
            Ok(Inbound::Closed) => break DirectionEnd::PeerClosed,
            Err(e) => {
                debug!(error = %e, "uplink read failed");
                break DirectionEnd::Failed(e.to_string());
            }
        }
    };
    (DirectionReport { end, bytes }, ws_rx, tcp_tx)
}

/// TCP → WebSocket. Each non-empty read becomes one binary message.
async fn downlink<S>(
    mut tcp_rx: OwnedReadHalf,
    mut ws_tx: WsTx<S>,
    mut cancel: watch::Receiver<bool>,
    buffer_size: usize,
) -> (DirectionReport, OwnedReadHalf, WsTx<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut bytes = 0u64;
    let end = loop {
        let read = tokio::select! {
            _ = cancel.changed() => break DirectionEnd::Cancelled,
            r = tcp_rx.read(&mut buf) => r,
        };
        match read {
            Ok(0) => break DirectionEnd::PeerClosed,
            Ok(n) => {
                tokio::select! {
                    _ = cancel.changed() => break DirectionEnd::Cancelled,
                    r = ws_send_binary(&mut ws_tx, buf[..n].to_vec()) => {
                        if let Err(e) = r {
                            debug!(error = %e, "downlink send failed");
                            break DirectionEnd::Failed(e.to_string());
                        }
                    }
                }
                bytes += n as u64;
            }
            Err(e) => {
                debug!(error = %e, "downlink read failed");
                break DirectionEnd::Failed(e.to_string());
            }
        }
    };
    (DirectionReport { end, bytes }, tcp_rx, ws_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    /// Echo target; returns its address.
    async fn echo_target() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn next_binary(ws: &mut WebSocketStream<DuplexStream>) -> Vec<u8> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("ws error");
            if let Message::Binary(data) = msg {
                return data.to_vec();
            }
        }
    }

    #[tokio::test]
    async fn echo_round_trip_counts_bytes() {
        let target = echo_target().await;
        let tcp = TcpStream::connect(target).await.unwrap();
        let (server, mut client) = ws_pair().await;
        let relay_task = tokio::spawn(relay(server, tcp, 4096));

        let messages: Vec<Vec<u8>> = vec![
            b"hello".to_vec(),
            vec![0u8; 1000],
            (0..=255u8).collect(),
        ];
        for m in &messages {
            client.send(Message::Binary(m.clone().into())).await.unwrap();
            assert_eq!(&next_binary(&mut client).await, m);
        }

        client.close(None).await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .unwrap()
            .unwrap();

        let sent: u64 = messages.iter().map(|m| m.len() as u64).sum();
        assert_eq!(report.first, Direction::Uplink);
        assert_eq!(report.uplink.end, DirectionEnd::PeerClosed);
        assert_eq!(report.uplink.bytes, sent);
        assert_eq!(report.downlink.bytes, sent);
        assert_eq!(report.downlink.end, DirectionEnd::Cancelled);
    }

    #[tokio::test]
    async fn client_close_closes_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (mut target_side, _) = listener.accept().await.unwrap();

        let (server, mut client) = ws_pair().await;
        let relay_task = tokio::spawn(relay(server, tcp, 4096));

        client.close(None).await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), target_side.read(&mut buf))
            .await
            .expect("target was not closed")
            .unwrap();
        assert_eq!(n, 0);

        let report = relay_task.await.unwrap();
        assert_eq!(report.first, Direction::Uplink);
    }

    #[tokio::test]
    async fn target_close_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (mut target_side, _) = listener.accept().await.unwrap();

        let (server, mut client) = ws_pair().await;
        let relay_task = tokio::spawn(relay(server, tcp, 4096));

        target_side.write_all(b"bye").await.unwrap();
        drop(target_side);

        assert_eq!(next_binary(&mut client).await, b"bye");

        let report = tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.first, Direction::Downlink);
        assert_eq!(report.downlink.end, DirectionEnd::PeerClosed);
        assert_eq!(report.downlink.bytes, 3);
        assert_eq!(report.uplink.end, DirectionEnd::Cancelled);

        // Client then sees the close frame.
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap();
        assert!(matches!(msg, Some(Ok(Message::Close(_))) | None));
    }

    #[tokio::test]
    async fn text_frames_are_not_forwarded() {
        let target = echo_target().await;
        let tcp = TcpStream::connect(target).await.unwrap();
        let (server, mut client) = ws_pair().await;
        let relay_task = tokio::spawn(relay(server, tcp, 4096));

        client.send(Message::Text("ignored".into())).await.unwrap();
        client.send(Message::Binary(b"kept".to_vec().into())).await.unwrap();
        assert_eq!(next_binary(&mut client).await, b"kept");

        client.close(None).await.unwrap();
        let report = relay_task.await.unwrap();
        assert_eq!(report.uplink.bytes, 4);
    }
}
