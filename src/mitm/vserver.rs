//! The TLS-terminating virtual server behind a CONNECT-to-443 bridge.
//!
//! Each accepted connection is TLS-unwrapped and handed to hyper's
//! HTTP/1.1 driver with upgrades enabled, so browsers get keep-alive and
//! WebSockets over the tunnel while the backend only ever sees plain
//! HTTP on localhost.

use std::{convert::Infallible, io};

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, StreamBody, combinators::BoxBody};
use hyper::{
    body::{Frame, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::{io::AsyncWriteExt, net::TcpListener};
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::MitmContext;
use crate::{
    dashboard,
    error::ProxyError,
    fetch::STRIPPED_RESPONSE_HEADERS,
    parse::{self, HttpResponse, sanitize_request_headers},
    proxy::service_label,
    tunnel,
};

type Body = BoxBody<Bytes, io::Error>;

/// Accept loop for one virtual server. Runs until the process exits.
pub(super) async fn run(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    hostname: String,
    ctx: MitmContext,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%hostname, "virtual server accept failed: {err}");
                break;
            }
        };
        debug!(%hostname, %peer, "virtual server accepted bridge connection");
        let acceptor = acceptor.clone();
        let hostname = hostname.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(err) => {
                    debug!(%hostname, "tls handshake failed: {err}");
                    return;
                }
            };
            let service = service_fn(move |req| {
                let hostname = hostname.clone();
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(handle_request(req, &hostname, &ctx).await) }
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .with_upgrades()
                .await
            {
                debug!("virtual server connection ended: {err}");
            }
        });
    }
}

async fn handle_request(req: Request<Incoming>, hostname: &str, ctx: &MitmContext) -> Response<Body> {
    let mapping = ctx.services.mapping().await;
    let Some(&port) = mapping.get(service_label(hostname)) else {
        return text_response(
            StatusCode::BAD_GATEWAY,
            format!("No server found for \"{hostname}\""),
        );
    };

    if port == ctx.listen_port {
        return dashboard_response(req.uri().path(), &mapping, ctx.listen_port);
    }

    let result = if parse::is_upgrade(req.headers()) {
        proxy_upgrade(req, port).await
    } else {
        proxy_request(req, port, ctx).await
    };
    result.unwrap_or_else(|err| {
        debug!(%hostname, port, "virtual server request failed: {err}");
        text_response(StatusCode::BAD_GATEWAY, format!("Proxy error: {err}"))
    })
}

/// Proxies one plain HTTP exchange to the backend, streaming the body.
async fn proxy_request(
    req: Request<Incoming>,
    port: u16,
    ctx: &MitmContext,
) -> Result<Response<Body>, ProxyError> {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("http://localhost:{port}{path}");

    let mut headers = parts.headers;
    sanitize_request_headers(&mut headers);
    let host = HeaderValue::from_str(&format!("localhost:{port}"))
        .map_err(|_| ProxyError::BadRequest("invalid target port".into()))?;
    headers.insert(header::HOST, host);
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

    let body_bytes = body
        .collect()
        .await
        .map_err(|err| ProxyError::BadRequest(format!("request body: {err}")))?
        .to_bytes();

    let mut request = ctx.client.request(parts.method.clone(), &url).headers(headers);
    if parts.method != Method::GET && parts.method != Method::HEAD && !body_bytes.is_empty() {
        request = request.body(body_bytes);
    }
    let mut upstream = request.send().await?;
    debug!(status = %upstream.status(), %url, "virtual server backend response");

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    // Stream the body through a channel. If the client cancels mid-stream
    // the receiver drops; the reader task keeps draining the upstream to
    // EOF so the backend connection closes with FIN rather than RST.
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Frame<Bytes>, io::Error>>(8);
    tokio::spawn(async move {
        let mut client_gone = false;
        loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => {
                    if !client_gone && tx.send(Ok(Frame::data(chunk))).await.is_err() {
                        client_gone = true;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    if !client_gone {
                        let _ = tx.send(Err(io::Error::other(err))).await;
                    }
                    break;
                }
            }
        }
    });

    let body = BoxBody::new(StreamBody::new(ReceiverStream::new(rx)));
    builder
        .body(body)
        .map_err(|err| ProxyError::BadRequest(err.to_string()))
}

/// Relays a WebSocket upgrade: handshake with the backend first, then pipe
/// the hyper-upgraded stream against the backend socket byte-for-byte.
///
/// The client only sees 101 after the backend handshake has completed, so
/// there is no window in which client frames need buffering.
async fn proxy_upgrade(mut req: Request<Incoming>, port: u16) -> Result<Response<Body>, ProxyError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let backend = tunnel::connect_backend(port).await?;
    let (mut backend_read, mut backend_write) = backend.into_split();
    backend_write.write_all(&upgrade_head_bytes(&req, &path, port)).await?;

    // Frames the backend sent right behind its 101 are owed to the client
    // once the upgrade completes.
    let (reply, backend_residue) = HttpResponse::read_buffered(&mut backend_read).await?;
    if reply.status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = %reply.status, "backend refused websocket upgrade");
        return Ok(text_response(reply.status, "backend refused upgrade"));
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let (mut client_read, mut client_write) = tokio::io::split(TokioIo::new(upgraded));
                if let Err(err) = tunnel::splice(
                    &mut client_read,
                    &mut client_write,
                    &mut backend_read,
                    &mut backend_write,
                    Bytes::new(),
                    backend_residue,
                    None,
                )
                .await
                {
                    debug!("websocket pipe ended with error: {err}");
                }
            }
            Err(err) => debug!("client upgrade failed: {err}"),
        }
    });

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in reply.headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(empty_body())
        .map_err(|err| ProxyError::BadRequest(err.to_string()))
}

/// Serializes the client's upgrade handshake for the backend with the
/// request-target made relative and Host/Origin pointed at the backend.
fn upgrade_head_bytes(req: &Request<Incoming>, path: &str, port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path).as_bytes());
    out.extend_from_slice(format!("Host: localhost:{port}\r\n").as_bytes());
    out.extend_from_slice(format!("Origin: http://localhost:{port}\r\n").as_bytes());
    for (name, value) in req.headers() {
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

fn dashboard_response(
    path: &str,
    mapping: &std::collections::HashMap<String, u16>,
    listen_port: u16,
) -> Response<Body> {
    let (content_type, body) = if path == dashboard::PAC_PATH {
        (dashboard::PAC_CONTENT_TYPE, dashboard::render_pac(listen_port))
    } else {
        ("text/html; charset=utf-8", dashboard::render_index(mapping))
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(full_body(body))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "render failed"))
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(full_body(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn full_body(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn empty_body() -> Body {
    full_body(Bytes::new())
}
