//! Core server: one TCP listener shared by the disguise site and the tunnel.
//!
//! Each accepted connection runs a small HTTP/1.1 keep-alive loop. Every
//! request head goes through the [`Router`]; a valid upgrade on the tunnel
//! path leaves the loop, completes the WebSocket handshake and becomes a
//! [`Session`]. Everything else is answered by [`Disguise`].

use crate::admission::AdmissionController;
use crate::config::ServerConfig;
use crate::disguise::Disguise;
use crate::http::{read_request_head, HeadRead, HttpResponse, RequestHead};
use crate::relay::Session;
use crate::router::{Route, Router};
use crate::transport::websocket::accept_upgrade;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use veil_core::{VeilError, VeilResult};

/// How long a client may take to send a request head.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(10);
/// Requests served on one keep-alive connection before it is closed.
pub const MAX_REQUESTS_PER_CONNECTION: usize = 100;

/// The tunnel server instance.
pub struct TunnelServer {
    config: Arc<ServerConfig>,
    router: Router,
    disguise: Disguise,
    admission: Arc<AdmissionController>,
    /// Last assigned session id.
    next_session: AtomicU64,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let admission = Arc::new(AdmissionController::new(config.max_connections));
        Self {
            router: Router::new(&config),
            disguise: Disguise::new(config.clone(), admission.clone()),
            admission,
            config,
            next_session: AtomicU64::new(0),
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn disguise(&self) -> &Disguise {
        &self.disguise
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> VeilResult<TcpListener> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| VeilError::Transport(format!("bind {addr} failed: {e}")))?;
        info!(addr = %addr, "listener started");
        Ok(listener)
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(self) -> VeilResult<()> {
        let listener = self.bind().await?;
        Arc::new(self).serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> VeilResult<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut buf = Vec::with_capacity(1024);

        for served in 1..=MAX_REQUESTS_PER_CONNECTION {
            let head = match read_request_head(&mut stream, &mut buf, HEADER_TIMEOUT).await {
                Ok(HeadRead::Request(head)) => head,
                Ok(HeadRead::Closed) => return,
                Ok(HeadRead::Malformed(e)) => {
                    debug!(peer = %peer, error = %e, "malformed request head");
                    let _ = reply_and_close(&mut stream, HttpResponse::bad_request()).await;
                    return;
                }
                Ok(HeadRead::TooLarge) => {
                    debug!(peer = %peer, "request head too large");
                    let response = HttpResponse::text(431, "Request Header Fields Too Large");
                    let _ = reply_and_close(&mut stream, response).await;
                    return;
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "connection read failed");
                    return;
                }
            };

            let client = client_ip(&head, peer);
            let route = self.router.route(&head);
            debug!(client = %client, method = %head.method, ?route, "request");

            if let Route::Tunnel { key } = &route {
                self.handle_tunnel(stream, std::mem::take(&mut buf), key, client)
                    .await;
                return;
            }

            // Bodies are never read, so a request carrying one ends the connection.
            // A refused upgrade ends it too.
            let keep_alive = !head.wants_close()
                && !head.has_body()
                && !head.is_websocket_upgrade()
                && served < MAX_REQUESTS_PER_CONNECTION;

            let response = self.disguise.respond(&route, &head).await;
            let bytes = response.to_bytes(head.is_head(), keep_alive);
            if let Err(e) = stream.write_all(&bytes).await {
                debug!(client = %client, error = %e, "response write failed");
                return;
            }
            if !keep_alive {
                let _ = stream.shutdown().await;
                return;
            }
        }
    }

    async fn handle_tunnel(&self, stream: TcpStream, leftover: Vec<u8>, key: &str, client: String) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let ws = match accept_upgrade(stream, leftover, key).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(session = id, client = %client, error = %e, "upgrade failed");
                return;
            }
        };
        debug!(session = id, client = %client, "tunnel upgraded");

        Session::new(id)
            .run(ws, &self.config, &self.admission)
            .await;
    }
}

async fn reply_and_close(stream: &mut TcpStream, response: HttpResponse) -> std::io::Result<()> {
    stream.write_all(&response.to_bytes(false, false)).await?;
    stream.shutdown().await
}

/// Client address for logs: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket peer.
fn client_ip(head: &RequestHead, peer: SocketAddr) -> String {
    head.header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .or_else(|| head.header("x-real-ip"))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}
