use std::sync::{Arc, Mutex, OnceLock};

use crate::config::Options;
use crate::error::ProxyError;
use crate::rewrite;
use crate::server::ProxyServer;
use crate::store::CacheStore;

/// Process-wide proxy state behind the three host-facing calls. One server
/// at a time; initialised lazily on the first `start_server`.
struct FacadeState {
    server: Option<ProxyServer>,
    options: Options,
    started: bool,
}

fn state() -> &'static Mutex<FacadeState> {
    static STATE: OnceLock<Mutex<FacadeState>> = OnceLock::new();
    STATE.get_or_init(|| {
        Mutex::new(FacadeState {
            server: None,
            options: Options::default(),
            started: false,
        })
    })
}

/// Starts the proxy. Calling again with the same port is a no-op; asking
/// for a different port while running is refused so already-converted URLs
/// stay valid until the host explicitly restarts.
pub async fn start_server(options: Options) -> Result<(), ProxyError> {
    {
        let mut st = state().lock().expect("facade state");
        if let Some(server) = &st.server {
            if server.port() == options.port {
                return Ok(());
            }
            return Err(ProxyError::PortChangeWhileRunning {
                running: server.port(),
                requested: options.port,
            });
        }
        // Conversions issued while the bind is still in flight already use
        // the requested port.
        st.started = true;
        st.options = options.clone();
    }

    match ProxyServer::start(&options) {
        Ok(server) => {
            state().lock().expect("facade state").server = Some(server);
            Ok(())
        }
        Err(err) => {
            state().lock().expect("facade state").started = false;
            Err(err)
        }
    }
}

/// Stops the running server, if any. Idempotent.
pub async fn stop_server() {
    let server = {
        let mut st = state().lock().expect("facade state");
        st.started = false;
        st.server.take()
    };
    if let Some(server) = server {
        server.stop().await;
    }
}

/// Maps a remote URL to its proxied form. Falls back to the input when the
/// URL is marked non-cacheable or no start has been requested, so callers
/// can always hand the result straight to the player.
pub fn convert_url(remote_url: &str, is_cacheable: bool) -> String {
    if !is_cacheable {
        return remote_url.to_string();
    }
    let st = state().lock().expect("facade state");
    if !st.started {
        return remote_url.to_string();
    }
    rewrite::proxied_url(remote_url, st.options.port)
}

/// Purges the cache directory. Works with or without a running server; when
/// stopped, a transient store is opened just to clear it.
pub async fn clear_cache() -> Result<(), ProxyError> {
    let (server_store, options) = {
        let st = state().lock().expect("facade state");
        (st.server.as_ref().map(|s| s.store()), st.options.clone())
    };
    let store = match server_store {
        Some(store) => store,
        None => Arc::new(CacheStore::new(
            options.resolved_cache_root(),
            options.max_cache_bytes,
        )?),
    };
    let _ = tokio::task::spawn_blocking(move || store.clear_all()).await;
    Ok(())
}
