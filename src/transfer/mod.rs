//! Runtime-side model transfers (pull from registry, import from a local file)
//!
//! Both speak the runtime's NDJSON streaming protocol. A client runs at most
//! one transfer at a time; starting another finishes the previous stream
//! without an error.

mod import;
mod ndjson;
mod pull;

pub use import::ImportClient;
pub use ndjson::ProgressLine;
pub use pull::PullClient;

use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::RuntimeClient;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TransferEvent {
    Started {
        id: String,
    },
    Status {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        completed_bytes: u64,
        total_bytes: u64,
    },
    Completed,
}

impl TransferEvent {
    /// Completed fraction of a progress event; `None` while the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            Self::Progress {
                completed_bytes,
                total_bytes,
            } if *total_bytes > 0 => {
                Some((*completed_bytes as f64 / *total_bytes as f64).clamp(0.0, 1.0))
            }
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("runtime unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),

    #[error("runtime answered with status {status}: {body}")]
    InvalidStatus { status: u16, body: String },

    #[error("malformed progress line `{line}`: {source}")]
    MalformedLine {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    /// Error reported by the runtime itself.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferKind {
    Pull,
    Import,
}

impl TransferKind {
    fn label(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Import => "import",
        }
    }

    fn reports_progress(self) -> bool {
        matches!(self, Self::Pull)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    /// Superseded, or cancelled through the client.
    Cancelled,
}

/// Ordered events of one transfer.
///
/// Yields `Err` at most once, as the last item. Dropping the stream stops the
/// transfer.
pub struct TransferStream {
    id: String,
    rx: mpsc::Receiver<Result<TransferEvent, TransferError>>,
    token: CancellationToken,
}

impl TransferStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the stream to its end, handing each event to `on_event`.
    pub async fn finish<F>(mut self, mut on_event: F) -> Result<TransferOutcome, TransferError>
    where
        F: FnMut(&TransferEvent),
    {
        while let Some(item) = self.next().await {
            let event = item?;
            on_event(&event);
            if event == TransferEvent::Completed {
                return Ok(TransferOutcome::Completed);
            }
        }
        Ok(TransferOutcome::Cancelled)
    }
}

impl Stream for TransferStream {
    type Item = Result<TransferEvent, TransferError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl Drop for TransferStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Token of the transfer currently owned by a client.
#[derive(Default)]
pub(crate) struct ActiveSlot(Mutex<Option<CancellationToken>>);

impl ActiveSlot {
    /// Install `token`, cancelling whichever transfer held the slot.
    fn replace(&self, token: CancellationToken) {
        let previous = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn cancel(&self) -> bool {
        let current = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        match current {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }
}

pub(crate) fn spawn_transfer(
    client: &RuntimeClient,
    slot: &ActiveSlot,
    kind: TransferKind,
    id: String,
    url: Url,
    body: serde_json::Value,
) -> TransferStream {
    let token = CancellationToken::new();
    slot.replace(token.clone());
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    let client = client.clone();
    let task_token = token.clone();
    let task_id = id.clone();
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = task_token.cancelled() => {
                info!("{}_cancelled: {}", kind.label(), task_id);
                return;
            }
            result = drive(&client, kind, &task_id, &url, &body, &tx) => result,
        };
        if let Err(err) = result {
            warn!("{}_failed: {} error={}", kind.label(), task_id, err);
            let _ = tx.send(Err(err)).await;
        }
    });

    TransferStream { id, rx, token }
}

async fn drive(
    client: &RuntimeClient,
    kind: TransferKind,
    id: &str,
    url: &Url,
    body: &serde_json::Value,
    tx: &mpsc::Sender<Result<TransferEvent, TransferError>>,
) -> Result<(), TransferError> {
    info!("{}_start: {} url={}", kind.label(), id, url);
    if !emit(tx, TransferEvent::Started { id: id.to_string() }).await {
        return Ok(());
    }

    let response = client.post_stream(url, body).await?;
    let mut stream = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        pending.extend_from_slice(&chunk?);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            if !forward_line(kind, id, &line, tx).await? {
                return Ok(());
            }
        }
    }
    // Final line without a trailing newline.
    if !forward_line(kind, id, &pending, tx).await? {
        return Ok(());
    }

    info!("{}_complete: {}", kind.label(), id);
    emit(tx, TransferEvent::Completed).await;
    Ok(())
}

/// Translate and forward one line. `Ok(false)` once the consumer is gone.
async fn forward_line(
    kind: TransferKind,
    id: &str,
    line: &[u8],
    tx: &mpsc::Sender<Result<TransferEvent, TransferError>>,
) -> Result<bool, TransferError> {
    match ndjson::translate(kind, line)? {
        Some(event) => {
            debug!("{}_event: {} {:?}", kind.label(), id, event);
            Ok(emit(tx, event).await)
        }
        None => Ok(true),
    }
}

async fn emit(
    tx: &mpsc::Sender<Result<TransferEvent, TransferError>>,
    event: TransferEvent,
) -> bool {
    tx.send(Ok(event)).await.is_ok()
}
