//! Transfer worker - local copies and remote streaming into `<destination>.part`

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::DownloadError;
use crate::types::{DownloadEvent, DownloadRequest, DownloadSource};

/// Upper bound on the up-front write buffer allocation (8 MB)
const MAX_BUFFER_PREALLOC: usize = 8 * 1024 * 1024;

/// Session-scoped emitter. Stops delivering once the session is cancelled.
pub(crate) struct EventSink {
    tx: mpsc::Sender<Result<DownloadEvent, DownloadError>>,
    token: CancellationToken,
}

impl EventSink {
    pub(crate) fn new(
        tx: mpsc::Sender<Result<DownloadEvent, DownloadError>>,
        token: CancellationToken,
    ) -> Self {
        Self { tx, token }
    }

    /// Returns `false` when the session is gone and the transfer should unwind.
    async fn emit(&self, event: DownloadEvent) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.tx.send(Ok(event)) => sent.is_ok(),
        }
    }

    pub(crate) async fn fail(&self, err: DownloadError) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.tx.send(Err(err)) => {}
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }
}

/// Run one transfer to completion. Cancellation is `Ok(())` with no completion event.
pub(crate) async fn run(
    client: &Client,
    request: &DownloadRequest,
    source: &DownloadSource,
    chunk_size: usize,
    sink: &EventSink,
) -> Result<(), DownloadError> {
    let part = request.part_path();
    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(DownloadError::io(parent))?;
    }

    let finished = match source {
        DownloadSource::LocalFile(path) => {
            copy_local(request, path, &part, chunk_size, sink).await?
        }
        DownloadSource::Remote(url) => {
            fetch_remote(client, request, url, &part, chunk_size, sink).await?
        }
    };

    let Some(total) = finished else {
        info!("download_stopped: {}", request.id);
        return Ok(());
    };

    finalize(&part, &request.destination).await?;
    info!(
        "download_complete: {} bytes={} destination={}",
        request.id,
        total,
        request.destination.display()
    );
    sink.emit(DownloadEvent::Completed {
        destination: request.destination.clone(),
        total_bytes: total,
    })
    .await;
    Ok(())
}

/// Announced total, or the bytes actually written when it was never known.
fn reported_total(announced: u64, written: u64) -> u64 {
    if announced > 0 {
        announced
    } else {
        written
    }
}

async fn copy_local(
    request: &DownloadRequest,
    source: &Path,
    part: &Path,
    chunk_size: usize,
    sink: &EventSink,
) -> Result<Option<u64>, DownloadError> {
    let metadata = match fs::metadata(source).await {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(DownloadError::SourceNotFound(source.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(DownloadError::SourceNotFound(source.to_path_buf()))
        }
        Err(e) => return Err(DownloadError::io(source)(e)),
    };
    let total = metadata.len();

    let mut resumed = partial_len(part).await?;
    if resumed > total {
        warn!(
            "download_partial_oversized: {} partial={} total={}",
            request.id, resumed, total
        );
        discard_partial(part).await?;
        resumed = 0;
    }

    info!(
        "download_start: {} source=local resumed={} total={}",
        request.id, resumed, total
    );
    if !sink
        .emit(DownloadEvent::Started {
            resumed_bytes: resumed,
            total_bytes: total,
        })
        .await
    {
        return Ok(None);
    }

    let mut reader = File::open(source).await.map_err(DownloadError::io(source))?;
    reader
        .seek(SeekFrom::Start(resumed))
        .await
        .map_err(DownloadError::io(source))?;
    let mut file = open_partial(part, resumed).await?;

    let mut buffer = vec![0u8; chunk_size];
    let mut written = resumed;
    loop {
        if sink.is_cancelled() {
            return Ok(None);
        }
        let read = read_chunk(&mut reader, &mut buffer)
            .await
            .map_err(DownloadError::io(source))?;
        if read == 0 {
            break;
        }
        write_chunk(&mut file, &buffer[..read], part).await?;
        written += read as u64;
        if !sink
            .emit(DownloadEvent::Progress {
                bytes_written: written,
                total_bytes: total,
            })
            .await
        {
            return Ok(None);
        }
        // Large local copies never hit a network await; give cancellation a chance.
        tokio::task::yield_now().await;
    }

    Ok(Some(reported_total(total, written)))
}

async fn fetch_remote(
    client: &Client,
    request: &DownloadRequest,
    url: &Url,
    part: &Path,
    chunk_size: usize,
    sink: &EventSink,
) -> Result<Option<u64>, DownloadError> {
    let mut resumed = partial_len(part).await?;
    let mut restarted = false;

    let response = loop {
        let mut builder = client.get(url.clone());
        if resumed > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", resumed));
        }
        let response = tokio::select! {
            _ = sink.token.cancelled() => return Ok(None),
            response = builder.send() => response?,
        };

        let status = response.status();
        // A 206 for some other offset would be appended at the wrong place.
        let misplaced = status == StatusCode::PARTIAL_CONTENT
            && content_range_start(response.headers()).is_some_and(|start| start != resumed);
        let range_rejected = status == StatusCode::OK
            || status == StatusCode::RANGE_NOT_SATISFIABLE
            || misplaced;
        if resumed > 0 && range_rejected && !restarted {
            warn!(
                "download_range_ignored: {} status={} resumed={}",
                request.id,
                status.as_u16(),
                resumed
            );
            discard_partial(part).await?;
            resumed = 0;
            restarted = true;
            continue;
        }
        if !status.is_success() {
            return Err(DownloadError::InvalidStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        break response;
    };

    let partial = response.status() == StatusCode::PARTIAL_CONTENT;
    let total = if partial {
        content_range_total(response.headers())
            .or_else(|| response.content_length().map(|len| len + resumed))
            .unwrap_or(0)
    } else {
        response.content_length().unwrap_or(0)
    };

    info!(
        "download_start: {} source={} resumed={} total={}",
        request.id, url, resumed, total
    );
    if !sink
        .emit(DownloadEvent::Started {
            resumed_bytes: resumed,
            total_bytes: total,
        })
        .await
    {
        return Ok(None);
    }

    let mut file = open_partial(part, resumed).await?;
    let mut stream = response.bytes_stream();
    let mut buffer = Vec::with_capacity(chunk_size.min(MAX_BUFFER_PREALLOC));
    let mut written = resumed;

    loop {
        let next = tokio::select! {
            _ = sink.token.cancelled() => return Ok(None),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        buffer.extend_from_slice(&chunk?);

        // Network frames are arbitrary; write and report in whole chunks.
        let full = buffer.len() / chunk_size * chunk_size;
        for piece in buffer[..full].chunks(chunk_size) {
            write_chunk(&mut file, piece, part).await?;
            written += piece.len() as u64;
            debug!(
                "download_progress: {} bytes={} total={}",
                request.id, written, total
            );
            if !sink
                .emit(DownloadEvent::Progress {
                    bytes_written: written,
                    total_bytes: total,
                })
                .await
            {
                return Ok(None);
            }
        }
        buffer.drain(..full);
    }

    if !buffer.is_empty() {
        write_chunk(&mut file, &buffer, part).await?;
        written += buffer.len() as u64;
        if !sink
            .emit(DownloadEvent::Progress {
                bytes_written: written,
                total_bytes: total,
            })
            .await
        {
            return Ok(None);
        }
    }

    Ok(Some(reported_total(total, written)))
}

/// First byte from `Content-Range: bytes <start>-<end>/<total>`.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    range.split('-').next()?.trim().parse().ok()
}

/// Total size from `Content-Range: bytes <start>-<end>/<total>`; `None` for `*`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

async fn partial_len(part: &Path) -> Result<u64, DownloadError> {
    match fs::metadata(part).await {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(DownloadError::io(part)(e)),
    }
}

async fn discard_partial(part: &Path) -> Result<(), DownloadError> {
    match fs::remove_file(part).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(part)(e)),
    }
}

/// Append when resuming, otherwise start a fresh partial file.
async fn open_partial(part: &Path, resumed: u64) -> Result<File, DownloadError> {
    let result = if resumed > 0 {
        OpenOptions::new().append(true).open(part).await
    } else {
        File::create(part).await
    };
    result.map_err(DownloadError::io(part))
}

/// Each chunk is flushed before its progress event so a resume never overcounts.
async fn write_chunk(file: &mut File, bytes: &[u8], part: &Path) -> Result<(), DownloadError> {
    file.write_all(bytes).await.map_err(DownloadError::io(part))?;
    file.flush().await.map_err(DownloadError::io(part))
}

/// Fill `buffer` unless EOF arrives first.
async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

async fn finalize(part: &Path, destination: &Path) -> Result<(), DownloadError> {
    match fs::try_exists(part).await {
        Ok(true) => {}
        Ok(false) => return Err(DownloadError::CorruptedResumeState(part.to_path_buf())),
        Err(e) => return Err(DownloadError::io(part)(e)),
    }
    match fs::remove_file(destination).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(DownloadError::io(destination)(e)),
    }
    fs::rename(part, destination)
        .await
        .map_err(DownloadError::io(destination))
}
