#![allow(dead_code)]

use futures_util::StreamExt;
use resume_dl::{DownloadError, DownloadEvent, DownloadStream};

/// Deterministic, non-repeating-enough payload for byte comparisons.
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Drain a stream into its events and the terminal error, if any.
pub async fn collect(mut stream: DownloadStream) -> (Vec<DownloadEvent>, Option<DownloadError>) {
    let mut events = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => events.push(event),
            Err(err) => return (events, Some(err)),
        }
    }
    (events, None)
}

pub fn assert_monotonic(events: &[DownloadEvent]) {
    let mut last = 0;
    for event in events {
        let current = match event {
            DownloadEvent::Started { resumed_bytes, .. } => *resumed_bytes,
            DownloadEvent::Progress { bytes_written, .. } => *bytes_written,
            DownloadEvent::Completed { total_bytes, .. } => *total_bytes,
        };
        assert!(current >= last, "events went backwards: {:?}", events);
        last = current;
    }
}
