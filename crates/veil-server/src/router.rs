//! Request routing for the shared listener.
//!
//! Every request head maps to exactly one [`Route`]. Only a well-formed
//! WebSocket upgrade on the tunnel path reaches the relay; everything else
//! is disguise traffic.

use crate::config::ServerConfig;
use crate::http::RequestHead;

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Upgrade on the tunnel path, carrying the client's `Sec-WebSocket-Key`.
    Tunnel { key: String },
    /// Upgrade on the tunnel path with missing or wrong upgrade headers.
    BadUpgrade,
    /// Maintenance page.
    Root,
    /// Base64 share link.
    Subscription,
    /// JSON status document; `detailed` when the path mentions `status`.
    Status { detailed: bool },
    NotFound,
}

/// Path table built once from the configuration.
#[derive(Debug, Clone)]
pub struct Router {
    ws_path: String,
    secret_path: String,
    sub_path: Option<String>,
}

impl Router {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            ws_path: config.ws_path.clone(),
            secret_path: config.secret_path(),
            sub_path: config.sub_path.clone(),
        }
    }

    /// Decide the route for one request head.
    pub fn route(&self, head: &RequestHead) -> Route {
        let path = head.path();

        if head.is_websocket_upgrade() {
            if path != self.ws_path {
                return Route::NotFound;
            }
            return match upgrade_key(head) {
                Some(key) => Route::Tunnel { key },
                None => Route::BadUpgrade,
            };
        }

        if path.is_empty() || path == "/" {
            return Route::Root;
        }

        if path == self.secret_path || self.sub_path.as_deref() == Some(path) {
            return Route::Subscription;
        }

        if path.starts_with("/api/") {
            return Route::Status {
                detailed: path.contains("status"),
            };
        }

        Route::NotFound
    }
}

/// The `Sec-WebSocket-Key` of a valid RFC 6455 upgrade request.
fn upgrade_key(head: &RequestHead) -> Option<String> {
    if !head.method.eq_ignore_ascii_case("GET") {
        return None;
    }
    if !head.header_has_token("connection", "upgrade") {
        return None;
    }
    if head.header("sec-websocket-version").map(str::trim) != Some("13") {
        return None;
    }
    head.header("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, ConfigOverrides};
    use crate::http::parse_head;

    const UUID: &str = "add6222b-180c-4172-a920-62ed1ce06110";

    fn router() -> Router {
        let cfg = ServerConfig::resolve(
            ConfigFile::default(),
            ConfigOverrides {
                uuid: Some(UUID.into()),
                domain: Some("edge.example.org".into()),
                sub_path: Some("/sub".into()),
                ..Default::default()
            },
        )
        .unwrap();
        Router::new(&cfg)
    }

    fn head(raw: &str) -> RequestHead {
        let mut buf = raw.as_bytes().to_vec();
        parse_head(&mut buf).unwrap().unwrap()
    }

    fn get(path: &str) -> RequestHead {
        head(&format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n"))
    }

    fn upgrade(path: &str) -> RequestHead {
        head(&format!(
            "GET {path} HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
        ))
    }

    #[test]
    fn disguise_routes() {
        let r = router();
        assert_eq!(r.route(&get("/")), Route::Root);
        assert_eq!(r.route(&get("/?utm=1")), Route::Root);
        assert_eq!(r.route(&get(&format!("/{UUID}"))), Route::Subscription);
        assert_eq!(r.route(&get(&format!("/{UUID}?flag=1"))), Route::Subscription);
        assert_eq!(r.route(&get("/sub")), Route::Subscription);
        assert_eq!(r.route(&get("/api/status")), Route::Status { detailed: true });
        assert_eq!(r.route(&get("/api/health")), Route::Status { detailed: false });
        assert_eq!(r.route(&get("/nonexistent")), Route::NotFound);
        assert_eq!(r.route(&get("/api")), Route::NotFound);
    }

    #[test]
    fn upgrade_on_tunnel_path() {
        let r = router();
        assert_eq!(
            r.route(&upgrade("/api/v2/websocket")),
            Route::Tunnel {
                key: "dGhlIHNhbXBsZSBub25jZQ==".into()
            }
        );
    }

    #[test]
    fn upgrade_elsewhere_is_not_found() {
        let r = router();
        assert_eq!(r.route(&upgrade("/")), Route::NotFound);
        assert_eq!(r.route(&upgrade("/api/v2/websocket/extra")), Route::NotFound);
    }

    #[test]
    fn incomplete_upgrade_on_tunnel_path_is_flagged() {
        let r = router();
        let no_key = head(
            "GET /api/v2/websocket HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert_eq!(r.route(&no_key), Route::BadUpgrade);

        let wrong_version = head(
            "GET /api/v2/websocket HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Version: 8\r\nSec-WebSocket-Key: abc\r\n\r\n",
        );
        assert_eq!(r.route(&wrong_version), Route::BadUpgrade);

        let post = head(
            "POST /api/v2/websocket HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: abc\r\n\r\n",
        );
        assert_eq!(r.route(&post), Route::BadUpgrade);
    }

    #[test]
    fn plain_get_on_tunnel_path_looks_like_api() {
        let r = router();
        assert_eq!(
            r.route(&get("/api/v2/websocket")),
            Route::Status { detailed: false }
        );
    }
}
