//! One tunnel session, from upgrade to teardown.
//!
//! ```text
//! HANDSHAKING ──► CONNECTING ──► RELAYING ──► CLOSING ──► CLOSED
//!      │               │                         ▲
//!      └───────────────┴─────────────────────────┘  (rejection / timeout / connect failure)
//! ```
//!
//! The admission slot is taken after the handshake validates and is held by
//! an [`AdmissionGuard`] until the relay ends, so it is released exactly
//! once whichever path ends the session.

use super::engine::{relay, RelayReport};
use crate::admission::{AdmissionController, AdmissionGuard};
use crate::config::ServerConfig;
use crate::transport::target::dial;
use crate::transport::websocket::{close_quietly, ws_recv, ws_send_binary, Inbound};
use std::fmt;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace};
use veil_core::{parse_handshake, HandshakeError, VeilError};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Handshaking,
    Connecting,
    Relaying,
    Closing,
    Closed,
}

/// Which bounded wait expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Handshake,
    Connect,
}

/// Why a session ended.
#[derive(Debug, Clone)]
pub enum Teardown {
    /// Handshake failed validation; closed without a reply.
    Rejected(HandshakeError),
    /// Client went away before sending a handshake.
    ClientGone,
    TimedOut(Stage),
    ConnectFailed(String),
    /// WebSocket or TCP error outside the relay loops.
    Transport(String),
    /// Relay ran and finished.
    Relayed(RelayReport),
}

/// Per-session bookkeeping.
#[derive(Debug)]
pub struct Session {
    id: u64,
    state: SessionState,
    created_at: Instant,
    target: Option<String>,
    uplink: u64,
    downlink: u64,
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

impl Session {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: SessionState::Handshaking,
            created_at: Instant::now(),
            target: None,
            uplink: 0,
            downlink: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next` if it is ahead of the current state.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next <= self.state {
            trace!(session = %self, from = ?self.state, to = ?next, "ignored backward transition");
            return false;
        }
        trace!(session = %self, from = ?self.state, to = ?next, "state");
        self.state = next;
        true
    }

    /// Drive the session to completion and return why it ended.
    pub async fn run<S>(
        mut self,
        mut ws: WebSocketStream<S>,
        config: &ServerConfig,
        admission: &AdmissionController,
    ) -> Teardown
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let teardown = match self.establish(&mut ws, config, admission).await {
            Ok((tcp, guard)) => {
                self.advance(SessionState::Relaying);
                let report = relay(ws, tcp, config.buffer_size).await;
                self.advance(SessionState::Closing);
                self.uplink += report.uplink.bytes;
                self.downlink += report.downlink.bytes;
                guard.release();
                Teardown::Relayed(report)
            }
            Err(teardown) => {
                self.advance(SessionState::Closing);
                match teardown {
                    // No close frame: a probe learns nothing beyond a dropped socket.
                    Teardown::Rejected(_) => {
                        let _ = ws.get_mut().shutdown().await;
                    }
                    _ => close_quietly(&mut ws).await,
                }
                teardown
            }
        };

        self.advance(SessionState::Closed);
        self.log_close(&teardown);
        teardown
    }

    /// Handshake, admission, dial, ack, early payload.
    async fn establish<S>(
        &mut self,
        ws: &mut WebSocketStream<S>,
        config: &ServerConfig,
        admission: &AdmissionController,
    ) -> Result<(TcpStream, AdmissionGuard), Teardown>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let first = match tokio::time::timeout(config.handshake_timeout, ws_recv(ws)).await {
            Err(_) => return Err(Teardown::TimedOut(Stage::Handshake)),
            Ok(Err(e)) => return Err(Teardown::Transport(e.to_string())),
            Ok(Ok(Inbound::Closed)) => return Err(Teardown::ClientGone),
            Ok(Ok(Inbound::Text)) => return Err(Teardown::Rejected(HandshakeError::NotBinary)),
            Ok(Ok(Inbound::Binary(data))) => data,
        };

        let handshake = parse_handshake(&first, &config.identity).map_err(Teardown::Rejected)?;
        self.target = Some(handshake.endpoint());
        self.advance(SessionState::Connecting);
        debug!(session = %self, endpoint = %handshake.endpoint(), "handshake accepted");

        let guard = admission
            .acquire()
            .await
            .map_err(|e| Teardown::Transport(e.to_string()))?;

        let mut tcp = match dial(&handshake.target, handshake.port, config.connect_timeout).await {
            Ok(tcp) => tcp,
            Err(VeilError::Timeout) => return Err(Teardown::TimedOut(Stage::Connect)),
            Err(e) => return Err(Teardown::ConnectFailed(e.to_string())),
        };

        ws_send_binary(ws, handshake.ack().to_vec())
            .await
            .map_err(|e| Teardown::Transport(e.to_string()))?;

        if !handshake.payload.is_empty() {
            tcp.write_all(&handshake.payload)
                .await
                .map_err(|e| Teardown::Transport(e.to_string()))?;
            self.uplink += handshake.payload.len() as u64;
        }

        Ok((tcp, guard))
    }

    fn log_close(&self, teardown: &Teardown) {
        let duration_ms = self.created_at.elapsed().as_millis() as u64;
        let endpoint = self.target.as_deref().unwrap_or("-");
        match teardown {
            Teardown::Relayed(report) => info!(
                session = %self,
                endpoint,
                duration_ms,
                uplink = self.uplink,
                downlink = self.downlink,
                first = ?report.first,
                "session closed"
            ),
            Teardown::Rejected(reason) => {
                debug!(session = %self, reason = %reason, "handshake rejected")
            }
            Teardown::ClientGone => debug!(session = %self, "client left before handshake"),
            Teardown::TimedOut(stage) => {
                debug!(session = %self, endpoint, ?stage, duration_ms, "session timed out")
            }
            Teardown::ConnectFailed(e) => {
                info!(session = %self, endpoint, error = %e, "target connect failed")
            }
            Teardown::Transport(e) => {
                debug!(session = %self, endpoint, error = %e, "session transport error")
            }
        }
    }
}
