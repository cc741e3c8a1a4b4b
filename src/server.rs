use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Options;
use crate::constants;
use crate::error::ProxyError;
use crate::handler::ConnectionHandler;
use crate::source::HeadGate;
use crate::store::CacheStore;

/// State shared with every connection handler.
pub struct ServerShared {
    pub port: u16,
    pub store: Arc<CacheStore>,
    pub head_gate: Option<Arc<HeadGate>>,
}

struct ServerState {
    running: bool,
    next_conn_id: u64,
    handlers: HashMap<u64, CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
}

struct ServerInner {
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
    state: Mutex<ServerState>,
}

/// Loopback listener plus the registry of live connections. The server owns
/// its handlers; stopping cancels every handler, which in turn cancels its
/// data source and any in-flight download.
#[derive(Clone)]
pub struct ProxyServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("port", &self.inner.shared.port)
            .finish()
    }
}

impl ProxyServer {
    /// Binds `127.0.0.1:<port>` (IPv4) and starts accepting. A bind failure
    /// surfaces as `PortInUse` with no automatic port bump, so the host can
    /// compute proxied URLs deterministically.
    pub fn start(opts: &Options) -> Result<Self, ProxyError> {
        let root = opts.resolved_cache_root();
        let store = Arc::new(CacheStore::new(root, opts.max_cache_bytes)?);
        let listener = bind(opts.port)?;

        let shared = Arc::new(ServerShared {
            port: opts.port,
            store: Arc::clone(&store),
            head_gate: opts
                .head_only
                .then(|| Arc::new(HeadGate::new(constants::HEAD_ONLY_SEGMENT_LIMIT))),
        });
        let inner = Arc::new(ServerInner {
            shared,
            shutdown: CancellationToken::new(),
            state: Mutex::new(ServerState {
                running: true,
                next_conn_id: 1,
                handlers: HashMap::new(),
                accept_task: None,
            }),
        });

        let accept_task = tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        inner.state.lock().expect("server state").accept_task = Some(accept_task);
        schedule_prune(&inner, store);

        log::info!("proxy listening on 127.0.0.1:{}", opts.port);
        Ok(Self { inner })
    }

    pub fn port(&self) -> u16 {
        self.inner.shared.port
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().expect("server state").running
    }

    pub fn store(&self) -> Arc<CacheStore> {
        Arc::clone(&self.inner.shared.store)
    }

    /// Idempotent. Cancels the listener, then every live handler outside
    /// the lock, and waits for the accept loop to wind down.
    pub async fn stop(&self) {
        let (handlers, accept_task) = {
            let mut state = self.inner.state.lock().expect("server state");
            if !state.running {
                return;
            }
            state.running = false;
            (
                std::mem::take(&mut state.handlers),
                state.accept_task.take(),
            )
        };
        self.inner.shutdown.cancel();
        let open = handlers.len();
        for token in handlers.into_values() {
            token.cancel();
        }
        if let Some(task) = accept_task {
            let _ = task.await;
        }
        log::info!(
            "proxy stopped on 127.0.0.1:{} ({open} connections closed)",
            self.inner.shared.port
        );
    }

    pub fn clear_cache(&self) {
        self.inner.shared.store.clear_all();
    }
}

fn bind(port: u16) -> Result<TcpListener, ProxyError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = std::net::TcpListener::bind(addr).map_err(|err| {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            ProxyError::PortInUse { port }
        } else {
            ProxyError::Io(err)
        }
    })?;
    listener.set_nonblocking(true).map_err(ProxyError::Io)?;
    TcpListener::from_std(listener).map_err(ProxyError::Io)
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = listener.accept() => {
                match res {
                    Ok((stream, _peer)) => spawn_handler(&inner, stream),
                    Err(err) => log::warn!("accept failed: {err}"),
                }
            }
        }
    }
}

fn spawn_handler(inner: &Arc<ServerInner>, stream: tokio::net::TcpStream) {
    let token = inner.shutdown.child_token();
    let id = {
        let mut state = inner.state.lock().expect("server state");
        let id = state.next_conn_id;
        state.next_conn_id += 1;
        state.handlers.insert(id, token.clone());
        id
    };
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        ConnectionHandler::new(id, Arc::clone(&inner.shared))
            .run(stream, token)
            .await;
        inner
            .state
            .lock()
            .expect("server state")
            .handlers
            .remove(&id);
    });
}

/// One-shot prune shortly after start, off the accept path so bring-up I/O
/// never contends with the first playback requests.
fn schedule_prune(inner: &Arc<ServerInner>, store: Arc<CacheStore>) {
    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(constants::PRUNE_DELAY) => {
                let _ = tokio::task::spawn_blocking(move || store.prune()).await;
            }
        }
    });
}
