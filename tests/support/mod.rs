#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use bodega::http_range::ByteRange;
use bodega::rewrite::encode_query_value;
use bodega::server::ProxyServer;
use bodega::store::CacheStore;
use bodega::Options;

pub type BoxedResponse = Pin<Box<dyn Future<Output = Response<Full<Bytes>>> + Send>>;

pub struct MockServer {
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self::start_async(move |req| {
            let resp = handler(req);
            Box::pin(async move { resp }) as BoxedResponse
        })
        .await
    }

    pub async fn start_async<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> BoxedResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let fut = handler(req);
                                async move { Ok::<_, hyper::Error>(fut.await) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// A proxy instance on its own temp cache root. The tempdir lives as long
/// as the handle so entries can be inspected after requests complete.
pub struct TestProxy {
    pub server: ProxyServer,
    pub root: tempfile::TempDir,
}

pub async fn start_proxy(port: u16, max_cache_bytes: u64, head_only: bool) -> TestProxy {
    let root = tempfile::tempdir().expect("tempdir");
    let server = start_proxy_at(root.path(), port, max_cache_bytes, head_only);
    TestProxy { server, root }
}

pub fn start_proxy_at(
    root: &std::path::Path,
    port: u16,
    max_cache_bytes: u64,
    head_only: bool,
) -> ProxyServer {
    let opts = Options {
        port,
        max_cache_bytes,
        head_only,
        cache_root: Some(root.to_path_buf()),
    };
    ProxyServer::start(&opts).expect("start proxy")
}

impl TestProxy {
    pub fn store(&self) -> Arc<CacheStore> {
        self.server.store()
    }
}

#[derive(Debug, Clone)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw-socket GET against the proxy; the response is read to EOF since the
/// proxy always closes after one exchange.
pub async fn send_raw(port: u16, target: &str, extra_headers: &[(&str, &str)]) -> TestResponse {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect proxy");
    let mut req = format!("GET {target} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n");
    for (name, value) in extra_headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("Connection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.expect("send request");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");
    parse_response(&raw)
}

pub async fn proxy_get(port: u16, remote_url: &str, range: Option<&str>) -> TestResponse {
    let target = format!("/proxy?url={}", encode_query_value(remote_url));
    match range {
        Some(range) => send_raw(port, &target, &[("Range", range)]).await,
        None => send_raw(port, &target, &[]).await,
    }
}

fn parse_response(raw: &[u8]) -> TestResponse {
    let pos = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head terminator");
    let head = std::str::from_utf8(&raw[..pos]).expect("head is utf-8");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");
    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect();
    TestResponse {
        status,
        headers,
        body: Bytes::copy_from_slice(&raw[pos + 4..]),
    }
}

/// Origin handler for a fixed media payload with byte-range support.
pub fn resp_media(
    content_type: &'static str,
    data: Bytes,
) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static {
    move |req| {
        let size = data.len() as u64;
        let span = req
            .headers()
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .and_then(ByteRange::parse)
            .and_then(|r| r.resolve(size).ok());
        match span {
            Some(span) => Response::builder()
                .status(206)
                .header("Content-Type", content_type)
                .header("Content-Length", span.byte_len())
                .header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", span.start, span.end, size),
                )
                .body(Full::new(
                    data.slice(span.start as usize..=span.end as usize),
                ))
                .unwrap(),
            None => Response::builder()
                .status(200)
                .header("Content-Type", content_type)
                .header("Content-Length", size)
                .body(Full::new(data.clone()))
                .unwrap(),
        }
    }
}

pub fn resp_text(
    status: u16,
    body: &'static str,
) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static {
    move |_req| {
        Response::builder()
            .status(status)
            .header("Content-Length", body.len())
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }
}

pub fn gen_bytes(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}
