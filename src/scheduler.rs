use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::constants;
use crate::http_range::ByteRange;
use crate::rewrite::is_playlist_url;

type OriginClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Dispatch class, decided at submission time. `Fast` tasks are few, short
/// and playback-blocking (playlists, init segments, tiny probes); they skip
/// the concurrency gate. Everything else queues for a bulk permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Fast,
    Bulk,
}

/// Streaming callbacks for one download. Invoked from the task driving the
/// transfer; implementations forward chunks without blocking.
pub trait DownloadDelegate: Send + Sync {
    fn on_response(&self, status: u16, headers: &HeaderMap);
    fn on_data(&self, chunk: Bytes);
    fn on_complete(&self, error: Option<anyhow::Error>);
}

/// Process-wide download scheduler: one shared HTTP session with connection
/// reuse, and a counting semaphore bounding concurrent bulk transfers so a
/// fast-scrolling feed cannot exhaust sockets or file descriptors.
pub struct Downloader {
    client: OriginClient,
    bulk: Arc<Semaphore>,
    tasks: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

static SHARED: OnceLock<Downloader> = OnceLock::new();

impl Downloader {
    pub fn shared() -> &'static Downloader {
        SHARED.get_or_init(Downloader::new)
    }

    fn new() -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(constants::POOL_CONNS_PER_HOST)
            .build(https);
        Self {
            client,
            bulk: Arc::new(Semaphore::new(constants::MAX_CONCURRENT_BULK)),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Submits a fetch. Callbacks arrive on the transfer task; completion
    /// fires exactly once whatever the outcome (success, transport error,
    /// deadline, cancel while queued, cancel in flight). No internal
    /// retries; the caller decides.
    pub fn download(
        &'static self,
        url: Url,
        range: Option<ByteRange>,
        delegate: Arc<dyn DownloadDelegate>,
    ) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let priority = classify(&url, range.as_ref());
        self.tasks
            .lock()
            .expect("task registry")
            .insert(id, cancel.clone());

        let task = Arc::new(TaskState {
            id,
            cancel,
            fired: AtomicBool::new(false),
            delegate,
        });
        log::debug!("[dl {id}] {priority:?} {url}");
        tokio::spawn(run_task(self, url, range, priority, Arc::clone(&task)));
        TaskHandle { state: task }
    }

    /// Tasks submitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().expect("task registry").len()
    }

    /// Bulk permits currently free; back at the full bound when idle.
    pub fn idle_bulk_permits(&self) -> usize {
        self.bulk.available_permits()
    }
}

/// Handle returned to the submitter. Cancelling is idempotent and safe at
/// any point in the task lifecycle, including after completion.
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }
}

struct TaskState {
    id: u64,
    cancel: CancellationToken,
    fired: AtomicBool,
    delegate: Arc<dyn DownloadDelegate>,
}

fn classify(url: &Url, range: Option<&ByteRange>) -> Priority {
    if is_playlist_url(url.as_str()) || url.as_str().contains("init.mp4") {
        return Priority::Fast;
    }
    if let Some(len) = range.and_then(ByteRange::known_len) {
        if len < constants::SMALL_RANGE_PRIORITY_BYTES {
            return Priority::Fast;
        }
    }
    Priority::Bulk
}

async fn run_task(
    dl: &'static Downloader,
    url: Url,
    range: Option<ByteRange>,
    priority: Priority,
    task: Arc<TaskState>,
) {
    // The permit is held for the whole transfer and released when this task
    // returns, strictly after the completion latch has fired.
    let _permit = if priority == Priority::Bulk {
        tokio::select! {
            _ = task.cancel.cancelled() => {
                finish(dl, &task, Some(anyhow!("cancelled while queued")));
                return;
            }
            permit = Arc::clone(&dl.bulk).acquire_owned() => {
                Some(permit.expect("bulk semaphore closed"))
            }
        }
    } else {
        None
    };

    let outcome = tokio::select! {
        _ = task.cancel.cancelled() => Err(anyhow!("cancelled")),
        res = tokio::time::timeout(constants::REQUEST_DEADLINE, drive(dl, &url, range.as_ref(), &task)) => {
            match res {
                Ok(inner) => inner,
                Err(_) => Err(anyhow!("request deadline exceeded")),
            }
        }
    };
    finish(dl, &task, outcome.err());
}

async fn drive(
    dl: &Downloader,
    url: &Url,
    range: Option<&ByteRange>,
    task: &TaskState,
) -> Result<()> {
    let uri: http::Uri = url.as_str().parse().context("parse origin uri")?;
    let mut builder = http::Request::builder().method(Method::GET).uri(uri);
    if let Some(range) = range {
        builder = builder.header("Range", range.header_value());
    }
    let req = builder
        .body(Full::new(Bytes::new()))
        .context("build origin request")?;

    let resp = dl.client.request(req).await.context("origin request")?;
    let (parts, mut body) = resp.into_parts();
    task.delegate.on_response(parts.status.as_u16(), &parts.headers);

    while let Some(frame) = body.frame().await {
        let frame = frame.context("read origin body")?;
        if let Ok(data) = frame.into_data() {
            if !data.is_empty() {
                task.delegate.on_data(data);
            }
        }
    }
    Ok(())
}

/// One-shot completion: whichever of the transfer path or the cancel path
/// gets here first delivers `on_complete`; the loser is a no-op.
fn finish(dl: &Downloader, task: &TaskState, error: Option<anyhow::Error>) {
    if task.fired.swap(true, Ordering::SeqCst) {
        return;
    }
    dl.tasks.lock().expect("task registry").remove(&task.id);
    if let Some(err) = &error {
        log::debug!("[dl {}] failed: {err:#}", task.id);
    }
    task.delegate.on_complete(error);
}
