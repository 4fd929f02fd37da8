//! The connection front-end: accept, parse the request head, classify it
//! into exactly one route, and drive that route to completion.
//!
//! The plain listener serves one exchange per connection (`Connection:
//! close` on every HTTP response); raw-pipe routes stay open until either
//! side closes.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use http::{Method, StatusCode, Uri, header};
use tokio::{
    io::{self, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    dashboard,
    discovery::ServiceMap,
    error::ProxyError,
    fetch,
    mitm::{MitmContext, MitmRegistry},
    parse::{Authority, HttpResponse, RequestHead},
    tls::CertIssuer,
    tunnel,
};

/// The normalized service name for a host: the port and a trailing
/// `.localhost` are stripped, so `app`, `app.localhost`, and
/// `app.localhost:9090` all name the service `app`.
pub(crate) fn service_label(host: &str) -> &str {
    let host = host_without_port(host);
    host.strip_suffix(".localhost").unwrap_or(host)
}

fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    if host.matches(':').count() > 1 {
        return host; // raw IPv6 literal
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Host headers the proxy will answer for: local identities and bare
/// labels. Anything else gets `403 Forbidden`.
fn allowed_host(host: &str) -> bool {
    host == "localhost"
        || host.ends_with(".localhost")
        || host == "127.0.0.1"
        || host == "::1"
        || !host.contains('.')
}

/// The classification of one request. Exactly one variant is chosen per
/// connection; each carries only the fields its path needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Dashboard { path: String },
    ReverseHttp { port: u16, path: String },
    ReverseUpgrade { port: u16 },
    ForwardHttp { port: u16, path: String },
    ForwardUpgrade { port: u16, path: String },
    RedirectHttps { location: String },
    ConnectPlain { port: u16 },
    ConnectMitm { host: String },
    NotFound { host: String },
    Forbidden { host: String },
    Drop { reason: &'static str },
}

/// Applies the classification rules in order on a completed request head.
pub(crate) fn classify(
    head: &RequestHead,
    mapping: &HashMap<String, u16>,
    listen_port: u16,
    mitm_available: bool,
) -> Route {
    // CONNECT: tunnel to a named backend, MITM on 443 when possible.
    if head.method == Method::CONNECT {
        let Ok(authority) = Authority::from_connect_target(&head.target) else {
            return Route::Drop {
                reason: "unparseable CONNECT target",
            };
        };
        let Some(&port) = mapping.get(service_label(&authority.host)) else {
            return Route::Drop {
                reason: "CONNECT target not in mapping",
            };
        };
        if authority.port == 443 && mitm_available {
            return Route::ConnectMitm {
                host: authority.host,
            };
        }
        return Route::ConnectPlain { port };
    }

    // Absolute-form request-target: forward proxy.
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        let is_https = head.target.starts_with("https://");
        let Some((target_host, path)) = absolute_target_parts(&head.target) else {
            return Route::Drop {
                reason: "unparseable absolute-form target",
            };
        };
        let label = service_label(&target_host);
        if label == "localhost" {
            return Route::Dashboard { path };
        }
        let Some(&port) = mapping.get(label) else {
            // Closing without bytes lets the client's PAC DIRECT fallback run.
            return Route::Drop {
                reason: "forward target not in mapping",
            };
        };
        if port == listen_port {
            return Route::Dashboard { path };
        }
        if head.is_upgrade() {
            return Route::ForwardUpgrade { port, path };
        }
        if mitm_available && !is_https {
            return Route::RedirectHttps {
                location: format!("https://{target_host}{path}"),
            };
        }
        return Route::ForwardHttp { port, path };
    }

    // Origin-form: reverse proxy or the proxy's own identity.
    let path = head.target.clone();
    let Some(raw_host) = head.host() else {
        return Route::Dashboard { path };
    };
    let host = host_without_port(raw_host).to_string();
    if !allowed_host(&host) {
        return Route::Forbidden { host };
    }
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return Route::Dashboard { path };
    }
    match mapping.get(service_label(&host)) {
        Some(&port) if port == listen_port => Route::Dashboard { path },
        Some(&port) if head.is_upgrade() => Route::ReverseUpgrade { port },
        Some(&port) => Route::ReverseHttp { port, path },
        None => Route::NotFound { host },
    }
}

fn absolute_target_parts(target: &str) -> Option<(String, String)> {
    let uri: Uri = target.parse().ok()?;
    let host = uri.host()?.to_string();
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    Some((host, path))
}

/// The proxy server: shared discovery cache, outbound client, and the
/// optional MITM registry.
pub struct Proxy {
    services: Arc<ServiceMap>,
    client: reqwest::Client,
    mitm: Option<MitmRegistry>,
    listen_port: u16,
}

impl Proxy {
    /// Builds a proxy. MITM is available exactly when `issuer` is given.
    pub fn new(
        services: Arc<ServiceMap>,
        issuer: Option<Arc<dyn CertIssuer>>,
        listen_port: u16,
    ) -> reqwest::Result<Self> {
        let client = fetch::build_client()?;
        let mitm = issuer.map(|issuer| {
            MitmRegistry::new(
                issuer,
                MitmContext {
                    services: services.clone(),
                    client: client.clone(),
                    listen_port,
                },
            )
        });
        Ok(Self {
            services,
            client,
            mitm,
            listen_port,
        })
    }

    /// Accepts connections from the listener, each served in its own task.
    ///
    /// Runs until the listener errors; dropping the returned future
    /// cancels all in-flight connection tasks.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(cancel.child_token().run_until_cancelled_owned(async move {
                debug!(%peer, "accepted connection");
                this.handle_connection(stream).await;
            }));
        }
    }

    /// Serves one client connection, writing a mapped error response when
    /// the route fails recoverably and closing silently otherwise.
    pub async fn handle_connection(&self, mut conn: TcpStream) {
        if let Err(err) = self.handle_inner(&mut conn).await {
            match err.response() {
                Some(response) => {
                    debug!("request failed: {err}");
                    let (_, mut send) = conn.split();
                    if let Err(write_err) = response.write(&mut send).await {
                        debug!("failed to write error response: {write_err}");
                    }
                }
                None => debug!("connection closed: {err}"),
            }
        }
    }

    async fn handle_inner(&self, conn: &mut TcpStream) -> Result<(), ProxyError> {
        let (mut client_read, mut client_write) = conn.split();
        let (head, buffered) = RequestHead::read_buffered(&mut client_read).await?;

        let mapping = self.services.mapping().await;
        let route = classify(&head, &mapping, self.listen_port, self.mitm.is_some());
        debug!(method = %head.method, target = %head.target, ?route, "classified request");

        // Bytes that arrived behind the head: the request body seen so
        // far, or the first tunnel bytes after a CONNECT.
        let residue = buffered.slice(head.header_len..);

        match route {
            Route::Dashboard { path } => self.serve_dashboard(&path, &mut client_write).await,
            Route::ReverseHttp { port, path } => {
                fetch::proxy_http(&self.client, &head, port, &path, false, residue, &mut client_write)
                    .await
            }
            Route::ForwardHttp { port, path } => {
                fetch::proxy_http(&self.client, &head, port, &path, true, residue, &mut client_write)
                    .await
            }
            Route::ReverseUpgrade { port } => {
                let mut backend = tunnel::connect_backend(port).await?;
                let (mut backend_read, mut backend_write) = backend.split();
                // The backend gets the client's handshake verbatim.
                tunnel::splice(
                    &mut client_read,
                    &mut client_write,
                    &mut backend_read,
                    &mut backend_write,
                    buffered,
                    Bytes::new(),
                    None,
                )
                .await?;
                Ok(())
            }
            Route::ForwardUpgrade { port, path } => {
                let mut backend = tunnel::connect_backend(port).await?;
                let (mut backend_read, mut backend_write) = backend.split();
                let mut replay = head.to_backend_upgrade_bytes(&path, port);
                replay.extend_from_slice(&residue);
                tunnel::splice(
                    &mut client_read,
                    &mut client_write,
                    &mut backend_read,
                    &mut backend_write,
                    replay.into(),
                    Bytes::new(),
                    None,
                )
                .await?;
                Ok(())
            }
            Route::ConnectPlain { port } => {
                let mut backend = tunnel::connect_backend(port).await?;
                let (mut backend_read, mut backend_write) = backend.split();
                client_write.write_all(tunnel::CONNECTION_ESTABLISHED).await?;
                tunnel::splice(
                    &mut client_read,
                    &mut client_write,
                    &mut backend_read,
                    &mut backend_write,
                    residue,
                    Bytes::new(),
                    Some(port),
                )
                .await?;
                Ok(())
            }
            Route::ConnectMitm { host } => {
                // Classification only picks this route when MITM is on.
                let Some(registry) = self.mitm.as_ref() else {
                    return Err(ProxyError::BadRequest("mitm is not available".into()));
                };
                let vserver = registry.get_or_create(&host).await?;
                // Bridge first, 200 second: the client starts TLS only
                // after seeing the reply, so the ClientHello cannot arrive
                // before the bridge exists.
                let mut bridge = tunnel::connect_backend(vserver.port).await?;
                let (mut bridge_read, mut bridge_write) = bridge.split();
                client_write.write_all(tunnel::CONNECTION_ESTABLISHED).await?;
                tunnel::splice(
                    &mut client_read,
                    &mut client_write,
                    &mut bridge_read,
                    &mut bridge_write,
                    residue,
                    Bytes::new(),
                    None,
                )
                .await?;
                Ok(())
            }
            Route::RedirectHttps { location } => {
                HttpResponse::new(StatusCode::FOUND)
                    .with_header(header::LOCATION, &location)
                    .write(&mut client_write)
                    .await?;
                Ok(())
            }
            Route::NotFound { host } => Err(ProxyError::UnknownService { host }),
            Route::Forbidden { host } => Err(ProxyError::DisallowedHost { host }),
            Route::Drop { reason } => {
                debug!(reason, "closing without response");
                Ok(())
            }
        }
    }

    async fn serve_dashboard(
        &self,
        path: &str,
        send: &mut (impl tokio::io::AsyncWrite + Send + Unpin),
    ) -> Result<(), ProxyError> {
        let (content_type, body) = if path == dashboard::PAC_PATH {
            (
                dashboard::PAC_CONTENT_TYPE,
                dashboard::render_pac(self.listen_port),
            )
        } else {
            let mapping = self.services.mapping().await;
            ("text/html; charset=utf-8", dashboard::render_index(&mapping))
        };
        HttpResponse::new(StatusCode::OK)
            .with_header(header::CONTENT_TYPE, content_type)
            .with_body(body.into())
            .write(send)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTEN_PORT: u16 = 9090;

    fn mapping() -> HashMap<String, u16> {
        HashMap::from([
            ("testapp".to_string(), 3000),
            ("mirror".to_string(), LISTEN_PORT),
        ])
    }

    fn head(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap().unwrap()
    }

    fn classify_default(raw: &str) -> Route {
        classify(&head(raw), &mapping(), LISTEN_PORT, false)
    }

    #[test]
    fn reverse_host_routes_to_backend() {
        let route = classify_default("GET /a HTTP/1.1\r\nHost: testapp.localhost:9090\r\n\r\n");
        assert_eq!(route, Route::ReverseHttp { port: 3000, path: "/a".into() });
    }

    #[test]
    fn reverse_upgrade_detected() {
        let route = classify_default(
            "GET /ws HTTP/1.1\r\nHost: testapp.localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        );
        assert_eq!(route, Route::ReverseUpgrade { port: 3000 });
    }

    #[test]
    fn unknown_reverse_name_is_not_found() {
        let route = classify_default("GET / HTTP/1.1\r\nHost: nonexistent.localhost:9090\r\n\r\n");
        assert_eq!(route, Route::NotFound { host: "nonexistent.localhost".into() });
    }

    #[test]
    fn foreign_host_is_forbidden() {
        let route = classify_default("GET / HTTP/1.1\r\nHost: evil.example.com\r\n\r\n");
        assert_eq!(route, Route::Forbidden { host: "evil.example.com".into() });
    }

    #[test]
    fn localhost_and_loopback_serve_dashboard() {
        for host in ["localhost:9090", "127.0.0.1:9090", "[::1]:9090"] {
            let route = classify_default(&format!("GET /x HTTP/1.1\r\nHost: {host}\r\n\r\n"));
            assert_eq!(route, Route::Dashboard { path: "/x".into() }, "host {host}");
        }
    }

    #[test]
    fn missing_host_serves_dashboard() {
        let route = classify_default("GET / HTTP/1.1\r\n\r\n");
        assert_eq!(route, Route::Dashboard { path: "/".into() });
    }

    #[test]
    fn name_mapped_to_listener_port_serves_dashboard() {
        let route = classify_default("GET / HTTP/1.1\r\nHost: mirror.localhost\r\n\r\n");
        assert_eq!(route, Route::Dashboard { path: "/".into() });
    }

    #[test]
    fn absolute_form_is_forward_proxy() {
        let route = classify_default("GET http://testapp/p?q=1 HTTP/1.1\r\nHost: testapp\r\n\r\n");
        assert_eq!(route, Route::ForwardHttp { port: 3000, path: "/p?q=1".into() });
    }

    #[test]
    fn forward_redirects_to_https_when_mitm_available() {
        let route = classify(
            &head("GET http://testapp/p HTTP/1.1\r\nHost: testapp\r\n\r\n"),
            &mapping(),
            LISTEN_PORT,
            true,
        );
        assert_eq!(
            route,
            Route::RedirectHttps { location: "https://testapp/p".into() }
        );
    }

    #[test]
    fn forward_upgrade_is_piped_even_with_mitm() {
        let route = classify(
            &head(
                "GET http://testapp/ws HTTP/1.1\r\nHost: testapp\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            ),
            &mapping(),
            LISTEN_PORT,
            true,
        );
        assert_eq!(route, Route::ForwardUpgrade { port: 3000, path: "/ws".into() });
    }

    #[test]
    fn unknown_forward_target_drops() {
        let route = classify_default("GET http://nonexistent/ HTTP/1.1\r\nHost: nonexistent\r\n\r\n");
        assert!(matches!(route, Route::Drop { .. }));
    }

    #[test]
    fn connect_routes_plain_without_mitm() {
        let route = classify_default("CONNECT testapp:443 HTTP/1.1\r\n\r\n");
        assert_eq!(route, Route::ConnectPlain { port: 3000 });
        let route = classify_default("CONNECT testapp:80 HTTP/1.1\r\n\r\n");
        assert_eq!(route, Route::ConnectPlain { port: 3000 });
    }

    #[test]
    fn connect_443_uses_mitm_when_available() {
        let route = classify(
            &head("CONNECT testapp:443 HTTP/1.1\r\n\r\n"),
            &mapping(),
            LISTEN_PORT,
            true,
        );
        assert_eq!(route, Route::ConnectMitm { host: "testapp".into() });
        // Port 80 tunnels stay plain even with MITM available.
        let route = classify(
            &head("CONNECT testapp:80 HTTP/1.1\r\n\r\n"),
            &mapping(),
            LISTEN_PORT,
            true,
        );
        assert_eq!(route, Route::ConnectPlain { port: 3000 });
    }

    #[test]
    fn unknown_connect_target_drops() {
        let route = classify_default("CONNECT nonexistent:443 HTTP/1.1\r\n\r\n");
        assert!(matches!(route, Route::Drop { .. }));
    }

    #[test]
    fn service_label_strips_port_and_suffix() {
        assert_eq!(service_label("app.localhost:9090"), "app");
        assert_eq!(service_label("app.localhost"), "app");
        assert_eq!(service_label("app:9090"), "app");
        assert_eq!(service_label("app"), "app");
        assert_eq!(service_label("localhost"), "localhost");
    }

    #[test]
    fn allowed_host_covers_local_identities_and_bare_labels() {
        for host in ["localhost", "app.localhost", "127.0.0.1", "::1", "bare"] {
            assert!(allowed_host(host), "{host}");
        }
        for host in ["example.com", "app.internal", "127.0.0.2.example"] {
            assert!(!allowed_host(host), "{host}");
        }
    }
}
