//! Share-link construction.
//!
//! Builds the client import URI
//! `vless://<identity>@<domain>:<port>?<params>#<node>` and wraps it in
//! standard base64, the format subscription clients expect.

use crate::error::VeilResult;
use crate::identity::Identity;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use url::form_urlencoded;

/// URI scheme understood by tunnel clients.
pub const SCHEME: &str = "vless";

/// Everything a share link encodes.
#[derive(Debug, Clone)]
pub struct LinkParams<'a> {
    pub identity: &'a Identity,
    /// Public hostname clients dial (also SNI and `Host`).
    pub domain: &'a str,
    /// Public port, usually the TLS front's 443.
    pub port: u16,
    /// WebSocket path on the server.
    pub path: &'a str,
    /// Display name, placed in the fragment.
    pub node_name: &'a str,
    /// Whether the upstream front terminates TLS.
    pub tls: bool,
}

impl LinkParams<'_> {
    /// Render the plain URI.
    pub fn uri(&self) -> String {
        let host = escape(self.domain);
        let security = if self.tls {
            format!("security=tls&sni={host}&fp=chrome")
        } else {
            "security=none".to_string()
        };
        format!(
            "{SCHEME}://{id}@{domain}:{port}?encryption=none&{security}&type=ws&host={host}&path={path}#{node}",
            id = self.identity,
            domain = self.domain,
            port = self.port,
            path = escape(self.path),
            node = escape(self.node_name),
        )
    }

    /// Render the base64-wrapped URI served to subscription clients.
    pub fn encoded(&self) -> String {
        encode_link(&self.uri())
    }
}

/// Percent-escape a query value or fragment. Spaces become `%20`, not `+`.
fn escape(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Base64-wrap a URI.
pub fn encode_link(uri: &str) -> String {
    STANDARD.encode(uri.as_bytes())
}

/// Reverse of [`encode_link`].
pub fn decode_link(encoded: &str) -> VeilResult<String> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        "add6222b-180c-4172-a920-62ed1ce06110".parse().unwrap()
    }

    #[test]
    fn uri_carries_domain_path_and_node() {
        let id = identity();
        let params = LinkParams {
            identity: &id,
            domain: "edge.example.org",
            port: 443,
            path: "/api/v2/websocket",
            node_name: "VPS-Node",
            tls: true,
        };
        assert_eq!(
            params.uri(),
            "vless://add6222b-180c-4172-a920-62ed1ce06110@edge.example.org:443\
             ?encryption=none&security=tls&sni=edge.example.org&fp=chrome\
             &type=ws&host=edge.example.org&path=%2Fapi%2Fv2%2Fwebsocket#VPS-Node"
        );
    }

    #[test]
    fn encoded_link_decodes_to_the_same_uri() {
        let id = identity();
        let params = LinkParams {
            identity: &id,
            domain: "edge.example.org",
            port: 8443,
            path: "/ws?ed=2048",
            node_name: "tokyo-1",
            tls: false,
        };
        let uri = params.uri();
        assert!(uri.contains("security=none"));
        assert!(uri.contains("path=%2Fws%3Fed%3D2048"));
        assert!(uri.ends_with("#tokyo-1"));
        assert!(!uri.contains("sni="));

        let decoded = decode_link(&params.encoded()).unwrap();
        assert_eq!(decoded, uri);
    }

    #[test]
    fn decode_rejects_non_base64() {
        assert!(decode_link("***").is_err());
    }

    #[test]
    fn node_name_is_escaped_in_fragment() {
        let id = identity();
        let params = LinkParams {
            identity: &id,
            domain: "edge.example.org",
            port: 443,
            path: "/ws",
            node_name: "Tokyo #1 é",
            tls: true,
        };
        let uri = params.uri();
        assert!(uri.ends_with("#Tokyo%20%231%20%C3%A9"));
        assert_eq!(uri.matches('#').count(), 1);
        assert!(!uri.contains(' '));
    }
}
