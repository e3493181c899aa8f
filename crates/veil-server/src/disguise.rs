//! Disguise responses: maintenance page, status API, subscription link.
//!
//! Headers are chosen to look like an ordinary nginx-fronted site.

use crate::admission::AdmissionController;
use crate::config::ServerConfig;
use crate::http::{HttpResponse, RequestHead};
use crate::router::Route;
use crate::subscription::SubscriptionStore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use veil_core::LinkParams;

/// Version reported by the status API.
pub const API_VERSION: &str = "1.0.0";

const SERVER_HEADER: &str = "nginx/1.24.0";

/// Served when the configured HTML file is missing or unreadable.
pub const FALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Site Maintenance</title>
    <style>
        body {
            font-family: Arial, sans-serif;
            max-width: 600px;
            margin: 100px auto;
            padding: 20px;
            text-align: center;
        }
        h1 { color: #333; }
        p { color: #666; line-height: 1.6; }
    </style>
</head>
<body>
    <h1>Scheduled Maintenance</h1>
    <p>This site is temporarily under maintenance. Please check back later.</p>
    <p><small>We apologize for any inconvenience.</small></p>
</body>
</html>"#;

/// JSON body of `/api/*`.
#[derive(Debug, Serialize)]
pub struct StatusDocument<'a> {
    pub status: &'a str,
    pub version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_sessions: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<&'a str>,
}

/// Handlers for every non-tunnel route.
pub struct Disguise {
    config: Arc<ServerConfig>,
    admission: Arc<AdmissionController>,
    store: SubscriptionStore,
}

impl Disguise {
    pub fn new(config: Arc<ServerConfig>, admission: Arc<AdmissionController>) -> Self {
        let store = SubscriptionStore::new(config.subscription_file());
        Self {
            config,
            admission,
            store,
        }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    /// Build the response for a disguise route.
    pub async fn respond(&self, route: &Route, head: &RequestHead) -> HttpResponse {
        match route {
            Route::Root => self.maintenance_page(head.header("if-none-match")).await,
            Route::Subscription => self.subscription().await,
            Route::Status { detailed } => self.status(*detailed),
            Route::Tunnel { .. } | Route::BadUpgrade | Route::NotFound => {
                HttpResponse::not_found()
            }
        }
    }

    /// `GET /`: configured page or the built-in fallback.
    pub async fn maintenance_page(&self, if_none_match: Option<&str>) -> HttpResponse {
        let body = match tokio::fs::read(&self.config.html_file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FALLBACK_PAGE.as_bytes().to_vec(),
            Err(e) => {
                warn!(path = %self.config.html_file.display(), error = %e, "cannot read page, serving fallback");
                FALLBACK_PAGE.as_bytes().to_vec()
            }
        };

        let etag = entity_tag(&body);
        if if_none_match.map(|v| v.trim() == etag).unwrap_or(false) {
            return HttpResponse::new(304)
                .header("Server", SERVER_HEADER)
                .header("ETag", etag);
        }

        HttpResponse::new(200)
            .with_body("text/html; charset=utf-8", body)
            .header("Server", SERVER_HEADER)
            .header("X-Powered-By", "Express")
            .header("Cache-Control", "public, max-age=3600")
            .header("ETag", etag)
    }

    /// `GET /<uuid>` or the configured subscription path.
    pub async fn subscription(&self) -> HttpResponse {
        let params = LinkParams {
            identity: &self.config.identity,
            domain: &self.config.domain,
            port: self.config.link_port,
            path: &self.config.ws_path,
            node_name: &self.config.node_name,
            tls: self.config.link_tls,
        };
        let encoded = params.encoded();

        if let Err(e) = self.store.save(&encoded).await {
            warn!(path = %self.store.path().display(), error = %e, "failed to persist subscription");
        }
        debug!("served subscription link");

        HttpResponse::new(200).with_body("text/plain", encoded)
    }

    /// `GET /api/*`.
    pub fn status(&self, detailed: bool) -> HttpResponse {
        let doc = if detailed {
            StatusDocument {
                status: "running",
                version: API_VERSION,
                node: Some(self.config.node_name.as_str()),
                connections: Some(self.admission.active()),
                max_connections: Some(self.admission.capacity()),
                total_sessions: Some(self.admission.total()),
                monitor: Some(enabled(self.config.monitor_endpoint.is_some())),
                tunnel: Some(enabled(self.config.external_tunnel)),
            }
        } else {
            StatusDocument {
                status: "ok",
                version: API_VERSION,
                node: None,
                connections: None,
                max_connections: None,
                total_sessions: None,
                monitor: None,
                tunnel: None,
            }
        };

        match serde_json::to_vec(&doc) {
            Ok(body) => HttpResponse::new(200)
                .with_body("application/json", body)
                .header("Server", SERVER_HEADER)
                .header("X-API-Version", API_VERSION)
                .header("Cache-Control", "no-cache"),
            Err(e) => {
                warn!(error = %e, "status serialization failed");
                HttpResponse::internal_error()
            }
        }
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

/// Quoted weak content hash: first 32 bits of SHA-256, hex.
pub fn entity_tag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", hex::encode(&digest[..4]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, ConfigOverrides};
    use veil_core::decode_link;

    const UUID: &str = "add6222b-180c-4172-a920-62ed1ce06110";

    fn disguise(dir: &std::path::Path, monitor: bool) -> Disguise {
        let cfg = ServerConfig::resolve(
            ConfigFile::default(),
            ConfigOverrides {
                uuid: Some(UUID.into()),
                domain: Some("edge.example.org".into()),
                html_file: Some(dir.join("index.html").to_string_lossy().into_owned()),
                cache_dir: Some(dir.join("cache").to_string_lossy().into_owned()),
                monitor_endpoint: monitor.then(|| "https://mon.example.org".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        Disguise::new(Arc::new(cfg), Arc::new(AdmissionController::new(7)))
    }

    #[tokio::test]
    async fn fallback_page_with_stable_etag() {
        let dir = tempfile::tempdir().unwrap();
        let d = disguise(dir.path(), false);

        let resp = d.maintenance_page(None).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.get_header("Content-Type"), Some("text/html; charset=utf-8"));
        assert_eq!(resp.get_header("Server"), Some("nginx/1.24.0"));
        assert_eq!(resp.body, FALLBACK_PAGE.as_bytes());

        let etag = resp.get_header("ETag").unwrap().to_string();
        assert_eq!(etag.len(), 10);
        assert_eq!(etag, entity_tag(FALLBACK_PAGE.as_bytes()));

        let cached = d.maintenance_page(Some(&etag)).await;
        assert_eq!(cached.status, 304);
        assert!(cached.body.is_empty());
    }

    #[tokio::test]
    async fn custom_page_is_served() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<h1>hi</h1>").unwrap();
        let d = disguise(dir.path(), false);
        let resp = d.maintenance_page(None).await;
        assert_eq!(resp.body, b"<h1>hi</h1>");
    }

    #[tokio::test]
    async fn subscription_is_base64_link_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let d = disguise(dir.path(), false);

        let resp = d.subscription().await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.get_header("Content-Type"), Some("text/plain"));

        let body = String::from_utf8(resp.body.clone()).unwrap();
        let uri = decode_link(&body).unwrap();
        assert!(uri.starts_with(&format!("vless://{UUID}@edge.example.org:443?")));
        assert!(uri.contains("path=%2Fapi%2Fv2%2Fwebsocket"));
        assert!(uri.ends_with("#VPS-Node"));

        let saved = d.store().load().await.unwrap();
        assert_eq!(saved.as_deref(), Some(body.as_str()));
    }

    #[tokio::test]
    async fn status_documents() {
        let dir = tempfile::tempdir().unwrap();
        let d = disguise(dir.path(), true);

        let short = d.status(false);
        assert_eq!(short.get_header("Content-Type"), Some("application/json"));
        let v: serde_json::Value = serde_json::from_slice(&short.body).unwrap();
        assert_eq!(v, serde_json::json!({"status": "ok", "version": "1.0.0"}));

        let full = d.status(true);
        let v: serde_json::Value = serde_json::from_slice(&full.body).unwrap();
        assert_eq!(v["status"], "running");
        assert_eq!(v["node"], "VPS-Node");
        assert_eq!(v["connections"], 0);
        assert_eq!(v["max_connections"], 7);
        assert_eq!(v["monitor"], "enabled");
        assert_eq!(v["tunnel"], "disabled");
    }
}
