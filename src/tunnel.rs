//! Raw splicing between a client and a backend: CONNECT tunnels and
//! WebSocket upgrade passthrough.
//!
//! Once set up, bytes are forwarded opaquely in both directions; nothing
//! reassembles frames or interprets higher layers. Each direction can
//! replay bytes that were consumed while parsing (the client's buffered
//! request on the way in, backend bytes that followed its `101` on the
//! way out), and the plain CONNECT path spends a single-shot `Host:`/
//! `Origin:` rewrite on the first client chunk.

use bytes::Bytes;
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::trace;

use crate::error::ProxyError;

/// Reply that opens a CONNECT tunnel.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Opens the TCP connection to a backend port on the loopback.
pub async fn connect_backend(port: u16) -> Result<TcpStream, ProxyError> {
    TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(ProxyError::BackendConnect)
}

/// Splices a client and a backend together until both directions end.
///
/// `to_backend` and `to_client` are replayed ahead of live socket bytes.
/// With `rewrite = Some(port)` the first client→backend chunk (replayed
/// or live, whichever comes first) has its `Host:` and `Origin:` lines
/// redirected to `localhost:<port>`; every later chunk passes through
/// untouched. EOF on one side half-closes the other so streamed bodies
/// end with FIN rather than a reset.
pub async fn splice(
    client_read: &mut (impl AsyncRead + Unpin),
    client_write: &mut (impl AsyncWrite + Unpin),
    backend_read: &mut (impl AsyncRead + Unpin),
    backend_write: &mut (impl AsyncWrite + Unpin),
    to_backend: Bytes,
    to_client: Bytes,
    rewrite: Option<u16>,
) -> io::Result<(u64, u64)> {
    let (up, down) = tokio::join!(
        feed(to_backend, client_read, backend_write, rewrite),
        feed(to_client, backend_read, client_write, None),
    );
    Ok((up?, down?))
}

/// Drives one direction: replay, copy until EOF, then shut the write side
/// down so the peer sees end-of-stream.
async fn feed(
    replay: Bytes,
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    mut rewrite: Option<u16>,
) -> io::Result<u64> {
    let result = pump(replay, &mut *reader, &mut *writer, &mut rewrite).await;
    writer.shutdown().await.ok();
    trace!(?result, "splice direction finished");
    result
}

async fn pump(
    replay: Bytes,
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    rewrite: &mut Option<u16>,
) -> io::Result<u64> {
    let mut total = 0u64;
    if !replay.is_empty() {
        total += write_chunk(&mut *writer, &replay, rewrite).await?;
    }
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        total += write_chunk(&mut *writer, &buf[..n], rewrite).await?;
    }
}

/// Writes one chunk, spending the rewrite slot if it is still armed.
async fn write_chunk(
    writer: &mut (impl AsyncWrite + Unpin),
    chunk: &[u8],
    rewrite: &mut Option<u16>,
) -> io::Result<u64> {
    match rewrite.take() {
        Some(port) => {
            let rewritten = rewrite_host_origin(chunk, port);
            writer.write_all(&rewritten).await?;
            Ok(rewritten.len() as u64)
        }
        None => {
            writer.write_all(chunk).await?;
            Ok(chunk.len() as u64)
        }
    }
}

/// Replaces `Host:` and `Origin:` lines in the header section of `chunk`
/// with `localhost:<port>` forms. Bytes past the blank line (request body
/// or tunnel payload) are copied verbatim.
fn rewrite_host_origin(chunk: &[u8], port: u16) -> Vec<u8> {
    let header_end = chunk
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .unwrap_or(chunk.len());
    let (head, rest) = chunk.split_at(header_end);

    let mut out = Vec::with_capacity(chunk.len() + 32);
    let mut i = 0;
    while i < head.len() {
        let line_end = head[i..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| i + p + 2)
            .unwrap_or(head.len());
        let line = &head[i..line_end];
        if starts_with_ignore_case(line, b"host:") {
            out.extend_from_slice(format!("Host: localhost:{port}\r\n").as_bytes());
        } else if starts_with_ignore_case(line, b"origin:") {
            out.extend_from_slice(format!("Origin: http://localhost:{port}\r\n").as_bytes());
        } else {
            out.extend_from_slice(line);
        }
        i = line_end;
    }
    out.extend_from_slice(rest);
    out
}

fn starts_with_ignore_case(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}
