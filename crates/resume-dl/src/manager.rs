//! Session table and event streams
//!
//! Each identity owns at most one transfer task. The table maps identity to
//! the task handle and its cancellation token; the lock is only held for
//! insert/replace/remove, never across I/O.

use futures_util::Stream;
use log::{debug, info, warn};
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{validate_chunk_size, DownloadOptions};
use crate::error::DownloadError;
use crate::types::{DownloadEvent, DownloadRequest, DownloadSource};
use crate::worker::{self, EventSink};

/// Events buffered per session before the transfer waits for the consumer
const EVENT_BUFFER: usize = 64;

type SessionTable = Arc<Mutex<HashMap<String, SessionEntry>>>;

struct SessionEntry {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Starts, supersedes and cancels resumable transfers.
///
/// Dropping the manager stops every session it started. Their streams end
/// with [`DownloadError::ManagerDropped`], so keep the manager alive for as
/// long as any stream is being consumed.
pub struct DownloadManager {
    client: Client,
    options: DownloadOptions,
    sessions: SessionTable,
    next_generation: AtomicU64,
    /// Parent of every session token; cancelled on drop.
    shutdown: CancellationToken,
}

impl DownloadManager {
    pub fn new(options: DownloadOptions) -> Result<Self, DownloadError> {
        options.validate()?;
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .build()
            .map_err(|e| DownloadError::InvalidConfig(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            options,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Start (or restart) the transfer for `request.id`.
    ///
    /// An active session with the same id is superseded: its stream ends with
    /// no further events and its task is cancelled. Scheme and chunk-size
    /// errors are returned here, before any session state exists.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_download(&self, request: DownloadRequest) -> Result<DownloadStream, DownloadError> {
        let chunk_size = request.chunk_size.unwrap_or(self.options.chunk_size);
        validate_chunk_size(chunk_size)?;
        let source = DownloadSource::parse(&request.source)?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = self.shutdown.child_token();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let id = request.id.clone();

        let mut sessions = lock(&self.sessions);
        let previous = sessions.remove(&id).map(|entry| {
            info!("download_superseded: {} generation={}", id, entry.generation);
            entry.token.cancel();
            entry.handle.abort();
            entry.handle
        });

        let task_sessions = self.sessions.clone();
        let client = self.client.clone();
        let sink = EventSink::new(tx, token.clone());
        let handle = tokio::spawn(async move {
            // The superseded task may still own the partial file until it unwinds.
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let result = worker::run(&client, &request, &source, chunk_size, &sink).await;
            if let Err(err) = result {
                warn!("download_failed: {} error={}", request.id, err);
                sink.fail(err).await;
            }

            let mut sessions = lock(&task_sessions);
            if sessions
                .get(&request.id)
                .is_some_and(|entry| entry.generation == generation)
            {
                sessions.remove(&request.id);
            }
            debug!("download_session_closed: {} generation={}", request.id, generation);
        });

        sessions.insert(
            id.clone(),
            SessionEntry {
                generation,
                token: token.clone(),
                handle,
            },
        );
        drop(sessions);

        Ok(DownloadStream {
            id,
            rx,
            token,
            shutdown: self.shutdown.clone(),
            finished: false,
        })
    }

    /// Cancel the session for `id`, leaving its partial file for a later resume.
    ///
    /// Returns `false` when no session was active. Resolves once the transfer
    /// task has unwound.
    pub async fn cancel_download(&self, id: &str) -> bool {
        let entry = lock(&self.sessions).remove(id);
        let Some(entry) = entry else {
            return false;
        };
        info!("download_cancelled: {} generation={}", id, entry.generation);
        entry.token.cancel();
        entry.handle.abort();
        let _ = entry.handle.await;
        true
    }

    pub fn is_active(&self, id: &str) -> bool {
        lock(&self.sessions).contains_key(id)
    }

    pub fn active_downloads(&self) -> Vec<String> {
        lock(&self.sessions).keys().cloned().collect()
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for (id, entry) in lock(&self.sessions).drain() {
            info!("download_dropped: {} generation={}", id, entry.generation);
            entry.token.cancel();
            entry.handle.abort();
        }
    }
}

fn lock(sessions: &SessionTable) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Final state of a stream driven by [`DownloadStream::completion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { destination: PathBuf, total_bytes: u64 },
    /// The session was cancelled or superseded before it completed.
    Cancelled,
}

/// Ordered events for one session.
///
/// Yields `Err` at most once, as the last item, or after `Completed`
/// nothing at all. Ends without an error when the session is cancelled or
/// superseded, and with [`DownloadError::ManagerDropped`] when its manager
/// goes away first.
pub struct DownloadStream {
    id: String,
    rx: mpsc::Receiver<Result<DownloadEvent, DownloadError>>,
    token: CancellationToken,
    shutdown: CancellationToken,
    finished: bool,
}

impl DownloadStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the stream to its end, handing each event to `progress`.
    pub async fn completion<F>(mut self, mut progress: F) -> Result<DownloadOutcome, DownloadError>
    where
        F: FnMut(&DownloadEvent),
    {
        use futures_util::StreamExt;

        while let Some(item) = self.next().await {
            let event = item?;
            progress(&event);
            if let DownloadEvent::Completed {
                destination,
                total_bytes,
            } = event
            {
                return Ok(DownloadOutcome::Completed {
                    destination,
                    total_bytes,
                });
            }
        }
        Ok(DownloadOutcome::Cancelled)
    }
}

impl Stream for DownloadStream {
    type Item = Result<DownloadEvent, DownloadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.token.is_cancelled() {
            this.finished = true;
            if this.shutdown.is_cancelled() {
                return Poll::Ready(Some(Err(DownloadError::ManagerDropped)));
            }
            return Poll::Ready(None);
        }
        let item = ready!(this.rx.poll_recv(cx));
        if item.is_none() && this.shutdown.is_cancelled() {
            this.finished = true;
            return Poll::Ready(Some(Err(DownloadError::ManagerDropped)));
        }
        if matches!(item, Some(Ok(DownloadEvent::Completed { .. })) | Some(Err(_))) {
            this.finished = true;
        }
        Poll::Ready(item)
    }
}
