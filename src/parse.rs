//! HTTP/1.1 head parsing straight off the socket, plus the header
//! helpers the proxy paths share.
//!
//! Only request/response heads are parsed; bodies are never interpreted
//! (no chunked decoding) and are forwarded as raw bytes. The readers here
//! hand back whatever arrived beyond the head, so raw-pipe paths can
//! replay the original bytes verbatim.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{HEADER_SECTION_MAX_LENGTH, error::ProxyError};

/// Headers that pertain to a single transport hop and must not be
/// forwarded through the proxy (RFC 9110 §7.6.1).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Conditional request headers stripped so backends never answer `304`.
pub const CONDITIONAL_HEADERS: &[&str] = &["if-none-match", "if-modified-since"];

/// Host and port parsed from a CONNECT request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl Authority {
    /// Parses an authority-form request target (`host[:port]`).
    ///
    /// The port defaults to 80 when absent.
    pub fn from_connect_target(target: &str) -> Result<Self, ProxyError> {
        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
                let port = port
                    .parse()
                    .map_err(|_| ProxyError::BadRequest(format!("invalid CONNECT port in {target:?}")))?;
                (host, port)
            }
            _ => (target, 80),
        };
        if host.is_empty() {
            return Err(ProxyError::BadRequest(format!(
                "invalid CONNECT target {target:?}"
            )));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// A parsed HTTP/1.x request head.
///
/// `target` is the raw request-target; classification decides whether it
/// is origin-form, absolute-form, or CONNECT authority-form.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    /// Length of the header section, including the terminating blank line.
    pub header_len: usize,
}

impl RequestHead {
    /// Parses a request head from a buffer; `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req
            .parse(buf)
            .map_err(|err| ProxyError::BadRequest(format!("invalid HTTP request: {err}")))?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method = req
                    .method
                    .ok_or_else(|| ProxyError::BadRequest("missing HTTP method".into()))?
                    .parse::<Method>()
                    .map_err(|_| ProxyError::BadRequest("invalid HTTP method".into()))?;
                let target = req
                    .path
                    .ok_or_else(|| ProxyError::BadRequest("missing request target".into()))?
                    .to_string();
                // Repeated header names collapse last-wins.
                let mut map = HeaderMap::new();
                for h in req.headers.iter() {
                    let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(h.name.as_bytes()),
                        HeaderValue::from_bytes(h.value),
                    ) else {
                        continue;
                    };
                    map.insert(name, value);
                }
                Ok(Some(Self {
                    method,
                    target,
                    headers: map,
                    header_len,
                }))
            }
        }
    }

    /// Reads from the socket until the request head is complete.
    ///
    /// Returns the head together with every byte received so far — the
    /// header section plus whatever early body or tunnel bytes came with
    /// it. Callers slice off `header_len` for the residue, or replay the
    /// whole buffer to a backend on the raw-pipe paths.
    pub async fn read_buffered<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<(Self, Bytes), ProxyError> {
        let mut buf = BytesMut::with_capacity(4 * 1024);
        loop {
            if reader.read_buf(&mut buf).await? == 0 {
                return Err(ProxyError::ClientClosed);
            }
            if let Some(head) = Self::parse(&buf)? {
                return Ok((head, buf.freeze()));
            }
            if buf.len() >= HEADER_SECTION_MAX_LENGTH {
                return Err(ProxyError::BadRequest(
                    "request header section exceeds buffer limit".into(),
                ));
            }
        }
    }

    /// The `Host` header value, if present and valid UTF-8.
    pub fn host(&self) -> Option<&str> {
        self.headers.get(header::HOST).and_then(|v| v.to_str().ok())
    }

    /// The declared request body length, if any.
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// WebSocket upgrade detection; see [`is_upgrade`].
    pub fn is_upgrade(&self) -> bool {
        is_upgrade(&self.headers)
    }

    /// Serializes the head for a backend, rewritten for an upgrade pass:
    /// relative request-line, `Host: localhost:<port>`, and
    /// `Origin: http://localhost:<port>`. All other headers (including the
    /// upgrade handshake headers) pass through verbatim.
    pub fn to_backend_upgrade_bytes(&self, path: &str, port: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len + 64);
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, path).as_bytes());
        out.extend_from_slice(format!("Host: localhost:{port}\r\n").as_bytes());
        if self.headers.contains_key(header::ORIGIN) {
            out.extend_from_slice(format!("Origin: http://localhost:{port}\r\n").as_bytes());
        }
        for (name, value) in self.headers.iter() {
            if name == header::HOST || name == header::ORIGIN {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// WebSocket upgrade detection: `Upgrade: websocket` (case-insensitive)
/// plus a `Connection` header carrying the `upgrade` token.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    upgrade && connection
}

/// Removes hop-by-hop and conditional headers before forwarding a request
/// to a backend.
pub fn sanitize_request_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS.iter().chain(CONDITIONAL_HEADERS) {
        headers.remove(*name);
    }
}

/// A parsed or hand-built HTTP/1.1 response head with an optional body.
///
/// Used for the proxy's own responses (errors, redirects, dashboard) and
/// for reading a backend's reply to an upgrade handshake.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A `text/plain` response with the given body.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .with_body(body.into().into())
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Formats the status line, e.g. `HTTP/1.1 404 Not Found`.
    pub fn status_line(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.reason
                .as_deref()
                .or(self.status.canonical_reason())
                .unwrap_or("")
        )
    }

    /// Writes the complete response. Always emits `Content-Length` and
    /// `Connection: close`; the plain listener serves one exchange per
    /// connection.
    pub async fn write(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.status_line().as_bytes());
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        writer.write_all(&out).await?;
        writer.flush().await
    }

    /// Parses a response head from a buffer; `None` when incomplete.
    ///
    /// Returns the length of the header section and the response (with an
    /// empty body; callers stream whatever follows separately).
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(buf)
            .map_err(|err| ProxyError::BadRequest(format!("invalid HTTP response: {err}")))?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res
                    .code
                    .ok_or_else(|| ProxyError::BadRequest("missing response status".into()))?;
                let status = StatusCode::from_u16(code)
                    .map_err(|_| ProxyError::BadRequest("invalid response status".into()))?;
                let reason = res.reason.map(ToOwned::to_owned);
                let mut map = HeaderMap::new();
                for h in res.headers.iter() {
                    let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(h.name.as_bytes()),
                        HeaderValue::from_bytes(h.value),
                    ) else {
                        continue;
                    };
                    map.insert(name, value);
                }
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        headers: map,
                        body: Bytes::new(),
                    },
                )))
            }
        }
    }

    /// Reads a response head from the socket.
    ///
    /// Returns the response together with any bytes that followed the
    /// head (an early body, or first frames behind a `101`), which the
    /// caller owes to whoever consumes the rest of the stream.
    pub async fn read_buffered<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<(Self, Bytes), ProxyError> {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if reader.read_buf(&mut buf).await? == 0 {
                return Err(ProxyError::BackendClosed);
            }
            if let Some((header_len, response)) = Self::parse_with_len(&buf)? {
                let mut raw = buf.freeze();
                let residue = raw.split_off(header_len);
                return Ok((response, residue));
            }
            if buf.len() >= HEADER_SECTION_MAX_LENGTH {
                return Err(ProxyError::BadRequest(
                    "response header section exceeds buffer limit".into(),
                ));
            }
        }
    }
}
