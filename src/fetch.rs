//! The HTTP proxy path: issue the client's request to the backend over a
//! fresh outbound connection and stream the response back, delimited by
//! closing the client connection.

use bytes::Bytes;
use http::{HeaderValue, Method, header};
use tokio::io::{self, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{
    error::ProxyError,
    parse::{RequestHead, sanitize_request_headers},
};

/// Response headers never forwarded to the client: the outbound client has
/// already decompressed the body, and the closing connection delimits it,
/// so the original framing headers would be wrong.
pub(crate) const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "content-encoding",
];

/// Builds the shared outbound client: redirects are not followed (they are
/// the backend's to issue), and environment proxy settings are ignored so
/// the proxy cannot route through itself.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
}

/// Proxies one HTTP exchange to `http://localhost:<target_port><path>`.
///
/// `rewrite_host` replaces the `Host` header with `localhost:<port>`
/// (forward-proxy requests); reverse-proxy requests keep the client's
/// original Host. `body` is whatever had arrived by the time the head
/// completed; it is forwarded only for non-GET/HEAD requests and is
/// never topped up from the socket.
pub async fn proxy_http(
    client: &reqwest::Client,
    head: &RequestHead,
    target_port: u16,
    path: &str,
    rewrite_host: bool,
    body: Bytes,
    writer: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<(), ProxyError> {
    let url = format!("http://localhost:{target_port}{path}");
    let mut headers = head.headers.clone();
    sanitize_request_headers(&mut headers);
    if rewrite_host {
        let host = HeaderValue::from_str(&format!("localhost:{target_port}"))
            .map_err(|_| ProxyError::BadRequest("invalid target port".into()))?;
        headers.insert(header::HOST, host);
    }
    // One backend connection per exchange.
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

    let mut request = client.request(head.method.clone(), &url).headers(headers);
    if head.method != Method::GET && head.method != Method::HEAD && !body.is_empty() {
        request = request.body(body);
    }

    let mut response = request.send().await?;
    debug!(status = %response.status(), %url, "backend response");

    write_response_head(&response, writer).await?;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => writer.write_all(&chunk).await?,
            Ok(None) => break,
            Err(err) => {
                // The head is already on the wire; closing the connection
                // is the only honest signal left.
                debug!("backend body failed mid-stream: {err}");
                return Err(ProxyError::BackendClosed);
            }
        }
    }
    writer.shutdown().await?;
    Ok(())
}

/// Serializes the backend's status line and filtered headers, appending
/// `Connection: close`.
async fn write_response_head(
    response: &reqwest::Response,
    writer: &mut (impl AsyncWrite + Send + Unpin),
) -> io::Result<()> {
    let status = response.status();
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in response.headers() {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    writer.write_all(&out).await
}
