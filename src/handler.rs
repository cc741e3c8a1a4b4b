use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use http::StatusCode;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::constants;
use crate::http_range::ByteRange;
use crate::server::ServerShared;
use crate::source::{DataSource, ResponseHead, ServeEvent};

/// One connection, one request. The player always speaks plain HTTP/1.1
/// GET with `Connection: close`; there is no keep-alive and no pipelining.
pub(crate) struct ConnectionHandler {
    id: u64,
    shared: Arc<ServerShared>,
}

struct RawRequest {
    method: String,
    target: String,
    range: Option<String>,
}

impl ConnectionHandler {
    pub(crate) fn new(id: u64, shared: Arc<ServerShared>) -> Self {
        Self { id, shared }
    }

    pub(crate) async fn run(self, mut stream: TcpStream, cancel: CancellationToken) {
        let source_cancel = cancel.child_token();
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = self.serve(&mut stream, &source_cancel) => {
                if let Err(err) = res {
                    log::debug!("[conn {}] closed: {err:#}", self.id);
                }
            }
        }
        source_cancel.cancel();
        let _ = stream.shutdown().await;
    }

    async fn serve(&self, stream: &mut TcpStream, cancel: &CancellationToken) -> Result<()> {
        let Some(request) = read_request(stream).await? else {
            return Ok(());
        };

        let url = match self.accept(&request) {
            Ok(url) => url,
            Err(err) => {
                log::debug!("[conn {}] rejected: {err:#}", self.id);
                return write_not_found(stream).await;
            }
        };
        let range = request.range.as_deref().and_then(ByteRange::parse);
        log::debug!(
            "[conn {}] GET {} range={:?}",
            self.id,
            url,
            request.range.as_deref().unwrap_or("-")
        );

        let source = DataSource::new(
            url,
            range,
            Arc::clone(&self.shared.store),
            self.shared.port,
            self.shared.head_gate.clone(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(source.run(tx, cancel.clone()));

        let mut wrote_head = false;
        while let Some(event) = rx.recv().await {
            match event {
                ServeEvent::Head(head) => {
                    write_head(stream, &head).await?;
                    wrote_head = true;
                }
                ServeEvent::Chunk(chunk) => {
                    stream.write_all(&chunk).await?;
                }
                ServeEvent::Done(Ok(())) => break,
                ServeEvent::Done(Err(err)) => {
                    log::debug!("[conn {}] source failed: {err:#}", self.id);
                    if !wrote_head {
                        return write_not_found(stream).await;
                    }
                    break;
                }
            }
        }
        stream.flush().await?;
        Ok(())
    }

    /// Only `GET /proxy?url=<encoded>` is served; everything else is a 404.
    fn accept(&self, request: &RawRequest) -> Result<Url> {
        if request.method != "GET" {
            bail!("unsupported method {}", request.method);
        }
        let (path, query) = request
            .target
            .split_once('?')
            .unwrap_or((request.target.as_str(), ""));
        if path != constants::PROXY_PATH {
            bail!("unknown path {path}");
        }
        let encoded = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("url="))
            .ok_or_else(|| anyhow!("missing url parameter"))?;
        let decoded = percent_decode_str(encoded)
            .decode_utf8()
            .context("decode url parameter")?;
        Url::parse(&decoded).with_context(|| format!("parse remote url {decoded:?}"))
    }
}

/// Buffers up to the header cap until the blank line, then parses the
/// request line and the one header this server cares about. Request bodies
/// are not supported; the player never sends one.
async fn read_request(stream: &mut TcpStream) -> Result<Option<RawRequest>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; constants::READ_CHUNK_SIZE];
    loop {
        if let Some(end) = find_head_end(&buf) {
            return parse_request(&buf[..end]).map(Some);
        }
        if buf.len() > constants::MAX_REQUEST_HEAD_BYTES {
            bail!("request head exceeds {} bytes", constants::MAX_REQUEST_HEAD_BYTES);
        }
        let n = stream.read(&mut chunk).await.context("read request")?;
        if n == 0 {
            // Peer closed before sending a full request head.
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request(head: &[u8]) -> Result<RawRequest> {
    let text = std::str::from_utf8(head).context("request head is not utf-8")?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    if method.is_empty() || target.is_empty() {
        bail!("malformed request line {request_line:?}");
    }

    let mut range = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }
    Ok(RawRequest {
        method,
        target,
        range,
    })
}

async fn write_head(stream: &mut TcpStream, head: &ResponseHead) -> Result<()> {
    let reason = StatusCode::from_u16(head.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("OK");
    let mut text = format!("HTTP/1.1 {} {}\r\n", head.status, reason);
    text.push_str("Connection: close\r\n");
    text.push_str("Access-Control-Allow-Origin: *\r\n");
    for (name, value) in &head.headers {
        text.push_str(name);
        text.push_str(": ");
        text.push_str(value);
        text.push_str("\r\n");
    }
    text.push_str("\r\n");
    stream
        .write_all(text.as_bytes())
        .await
        .context("write response head")
}

async fn write_not_found(stream: &mut TcpStream) -> Result<()> {
    let head = ResponseHead {
        status: 404,
        headers: vec![("Content-Length".into(), "0".into())],
    };
    write_head(stream, &head).await
}
