//! Minimal HTTP/1.1 framing for the shared listener.
//!
//! Request heads are parsed with `httparse`; anything after the head stays
//! in the caller's buffer so a WebSocket upgrade can hand those bytes on.
//! Responses always carry an exact `Content-Length`.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};
use veil_core::{VeilError, VeilResult};

/// Largest request head accepted.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;
/// Most headers accepted in one request.
pub const MAX_HEADERS: usize = 64;

/// A parsed request line plus headers (names lowercased).
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Raw request target, query included.
    pub target: String,
    /// Minor HTTP version (0 or 1).
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request path with any query string removed.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    /// `Upgrade: websocket` present.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Whether a comma-separated header contains `token`.
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    /// Whether the connection should be closed after responding.
    pub fn wants_close(&self) -> bool {
        if self.header_has_token("connection", "close") {
            return true;
        }
        self.version == 0 && !self.header_has_token("connection", "keep-alive")
    }

    /// Whether a request body follows the head.
    pub fn has_body(&self) -> bool {
        let sized = self
            .header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|n| n > 0)
            .unwrap_or(false);
        sized || self.header("transfer-encoding").is_some()
    }
}

/// Outcome of reading one request head.
#[derive(Debug)]
pub enum HeadRead {
    Request(RequestHead),
    /// Peer closed (or went idle) before sending a full head.
    Closed,
    Malformed(String),
    TooLarge,
}

/// Try to parse a complete head from the front of `buf`.
///
/// On success the head bytes are drained from `buf`.
pub fn parse_head(buf: &mut Vec<u8>) -> Result<Option<RequestHead>, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&buf[..]) {
        Ok(httparse::Status::Complete(len)) => {
            let head = RequestHead {
                method: req.method.unwrap_or("").to_string(),
                target: req.path.unwrap_or("").to_string(),
                version: req.version.unwrap_or(1),
                headers: req
                    .headers
                    .iter()
                    .filter(|h| !h.name.is_empty())
                    .map(|h| {
                        (
                            h.name.to_ascii_lowercase(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect(),
            };
            buf.drain(..len);
            Ok(Some(head))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

/// Read until one full request head is buffered.
///
/// `buf` may already hold pipelined bytes from a previous request and keeps
/// whatever follows the head when this returns. `limit` bounds the whole
/// head, not each read.
pub async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    limit: Duration,
) -> VeilResult<HeadRead>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + limit;
    let mut chunk = [0u8; 2048];
    loop {
        if !buf.is_empty() {
            match parse_head(buf) {
                Ok(Some(head)) => return Ok(HeadRead::Request(head)),
                Ok(None) => {}
                Err(e) => return Ok(HeadRead::Malformed(e)),
            }
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Ok(HeadRead::TooLarge);
        }

        match timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => return Ok(HeadRead::Closed),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(VeilError::Io(e)),
        }
    }
}

/// An HTTP response ready to serialize.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.headers.push(("Content-Type", content_type.to_string()));
        self.body = body.into();
        self
    }

    /// `text/plain` response.
    pub fn text(status: u16, body: &str) -> Self {
        Self::new(status).with_body("text/plain", body.as_bytes())
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found")
    }

    pub fn bad_request() -> Self {
        Self::text(400, "Bad Request")
    }

    pub fn internal_error() -> Self {
        Self::text(500, "Internal Server Error")
    }

    /// Value of a header set on this response.
    #[cfg(test)]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize status line, headers and (unless `head_only`) body.
    ///
    /// `Content-Length` reflects the body even for HEAD requests.
    pub fn to_bytes(&self, head_only: bool, keep_alive: bool) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        out.push_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        if !head_only {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

/// Reason phrases for the statuses this server emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
