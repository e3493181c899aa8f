//! WebSocket upgrade and message helpers using tokio-tungstenite.
//!
//! The HTTP head is parsed by the router, so the upgrade is completed here
//! by hand: write the `101` response, then wrap the raw socket together with
//! any bytes that arrived after the head.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use veil_core::{VeilError, VeilResult};

/// Maximum inbound message size (1 MiB).
const MAX_WS_MESSAGE_SIZE: usize = 1_048_576;

/// One inbound application message.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Binary(Vec<u8>),
    /// Text frames carry nothing for the tunnel.
    Text,
    /// Close frame or end of stream.
    Closed,
}

/// The `101 Switching Protocols` response for `key`.
pub fn accept_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    )
}

/// Complete a server-side upgrade on `stream`.
///
/// `leftover` holds bytes already read past the request head; they are fed
/// to the WebSocket parser before anything new from the socket.
pub async fn accept_upgrade<S>(
    mut stream: S,
    leftover: Vec<u8>,
    key: &str,
) -> VeilResult<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(accept_response(key).as_bytes())
        .await
        .map_err(|e| VeilError::Transport(format!("WS upgrade write failed: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| VeilError::Transport(format!("WS upgrade flush failed: {e}")))?;

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_WS_MESSAGE_SIZE);

    Ok(WebSocketStream::from_partially_read(stream, leftover, Role::Server, Some(config)).await)
}

/// Helper: send a binary message.
pub async fn ws_send_binary<W>(ws: &mut W, data: Vec<u8>) -> VeilResult<()>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    ws.send(Message::Binary(data.into()))
        .await
        .map_err(|e| VeilError::Transport(format!("WS send failed: {e}")))
}

/// Helper: receive the next application message.
///
/// Ping/pong frames are skipped; tungstenite queues the pong reply itself.
pub async fn ws_recv<R>(ws: &mut R) -> VeilResult<Inbound>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(Inbound::Binary(data.to_vec())),
            Some(Ok(Message::Text(_))) => return Ok(Inbound::Text),
            Some(Ok(Message::Close(_))) | None => return Ok(Inbound::Closed),
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                return Ok(Inbound::Closed)
            }
            Some(Err(e)) => return Err(VeilError::Transport(format!("WS recv failed: {e}"))),
        }
    }
}

/// Close the WebSocket, ignoring errors (it may already be gone).
pub async fn close_quietly<S>(ws: &mut WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = ws.close(None).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        let resp = accept_response("dGhlIHNhbXBsZSBub25jZQ==");
        assert!(resp.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(resp.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(resp.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn leftover_bytes_reach_the_websocket() {
        let (_client_io, server_io) = tokio::io::duplex(4096);

        // A masked client frame (all-zero mask) that arrived with the head.
        let leftover = vec![0x82, 0x83, 0, 0, 0, 0, 1, 2, 3];
        let mut ws = accept_upgrade(server_io, leftover, "abc").await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(2), ws_recv(&mut ws))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Inbound::Binary(vec![1, 2, 3]));
    }
}
