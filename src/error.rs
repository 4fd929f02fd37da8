//! Connection-level error kinds and their mapping to client-facing
//! responses.

use http::StatusCode;

use crate::parse::HttpResponse;

/// Errors raised while serving one client connection.
///
/// Recoverable kinds map to an HTTP status via [`ProxyError::response`];
/// kinds that return `None` close the connection without writing anything
/// (they are still logged). Errors never cross connection boundaries.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The requested name has no entry in the service mapping.
    #[error("no server found for {host:?}")]
    UnknownService { host: String },

    /// The Host header named something other than a local identity.
    #[error("host {host:?} is not allowed")]
    DisallowedHost { host: String },

    /// The client sent something that does not parse as HTTP/1.x.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Opening the TCP connection to the backend failed.
    #[error("failed to connect to backend: {0}")]
    BackendConnect(#[source] std::io::Error),

    /// The outbound HTTP request to the backend failed.
    #[error("backend request failed: {0}")]
    BackendHttp(#[from] reqwest::Error),

    /// The backend closed before completing its part of the exchange.
    #[error("backend closed the connection")]
    BackendClosed,

    /// The client went away mid-exchange.
    #[error("client closed the connection")]
    ClientClosed,

    /// Preparing a TLS virtual server failed.
    #[error("tls setup failed: {0}")]
    Tls(#[from] crate::tls::TlsError),

    /// Structural socket error on either side.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// The response to write to the client, or `None` to close silently.
    pub fn response(&self) -> Option<HttpResponse> {
        match self {
            Self::UnknownService { host } => Some(HttpResponse::text(
                StatusCode::NOT_FOUND,
                format!("No server found for \"{host}\""),
            )),
            Self::DisallowedHost { host } => Some(HttpResponse::text(
                StatusCode::FORBIDDEN,
                format!("Host \"{host}\" is not allowed"),
            )),
            Self::BadRequest(reason) => Some(HttpResponse::text(
                StatusCode::BAD_REQUEST,
                format!("Bad request: {reason}"),
            )),
            Self::BackendConnect(err) => Some(HttpResponse::text(
                StatusCode::BAD_GATEWAY,
                format!("Proxy error: could not reach backend: {err}"),
            )),
            Self::BackendHttp(err) => Some(HttpResponse::text(
                StatusCode::BAD_GATEWAY,
                format!("Proxy error: backend request failed: {err}"),
            )),
            Self::Tls(err) => Some(HttpResponse::text(
                StatusCode::BAD_GATEWAY,
                format!("Proxy error: tls setup failed: {err}"),
            )),
            Self::BackendClosed | Self::ClientClosed | Self::Io(_) => None,
        }
    }
}
