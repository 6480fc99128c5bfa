//! Download request and event types

use serde::Serialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::DownloadError;

/// Suffix appended to the destination while a transfer is in flight
pub const PART_SUFFIX: &str = ".part";

/// A single transfer keyed by `id`.
///
/// The id is the unit of concurrency control: starting a second request with
/// the same id supersedes the first.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: String,
    pub source: String,
    pub destination: PathBuf,
    pub chunk_size: Option<usize>,
}

impl DownloadRequest {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            destination: destination.into(),
            chunk_size: None,
        }
    }

    /// Override the manager's chunk size for this request only.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// `<destination>.part`
    pub fn part_path(&self) -> PathBuf {
        part_path_for(&self.destination)
    }
}

pub(crate) fn part_path_for(destination: &Path) -> PathBuf {
    let mut raw = destination.as_os_str().to_owned();
    raw.push(PART_SUFFIX);
    PathBuf::from(raw)
}

/// Where the bytes come from, resolved from the request's locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSource {
    LocalFile(PathBuf),
    Remote(Url),
}

impl DownloadSource {
    /// Accepts `http(s)://` URLs, `file://` URLs and bare filesystem paths.
    pub fn parse(locator: &str) -> Result<Self, DownloadError> {
        let Ok(url) = Url::parse(locator) else {
            return Ok(Self::LocalFile(PathBuf::from(locator)));
        };
        match url.scheme() {
            "http" | "https" => Ok(Self::Remote(url)),
            "file" => url
                .to_file_path()
                .map(Self::LocalFile)
                .map_err(|_| DownloadError::UnsupportedScheme(locator.to_string())),
            // Windows drive letters parse as one-letter schemes
            scheme if scheme.len() == 1 => Ok(Self::LocalFile(PathBuf::from(locator))),
            scheme => Err(DownloadError::UnsupportedScheme(scheme.to_string())),
        }
    }
}

/// Progress events for one session, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DownloadEvent {
    #[serde(rename_all = "camelCase")]
    Started { resumed_bytes: u64, total_bytes: u64 },
    #[serde(rename_all = "camelCase")]
    Progress { bytes_written: u64, total_bytes: u64 },
    #[serde(rename_all = "camelCase")]
    Completed {
        destination: PathBuf,
        total_bytes: u64,
    },
}

impl DownloadEvent {
    /// Completed fraction in `0.0..=1.0`, or `None` while the total is unknown.
    ///
    /// A total of 0 means the source never announced its size; it is not
    /// treated as "already complete".
    pub fn fraction(&self) -> Option<f64> {
        let (done, total) = match self {
            Self::Started {
                resumed_bytes,
                total_bytes,
            } => (*resumed_bytes, *total_bytes),
            Self::Progress {
                bytes_written,
                total_bytes,
            } => (*bytes_written, *total_bytes),
            Self::Completed { .. } => return Some(1.0),
        };
        if total == 0 {
            return None;
        }
        Some((done as f64 / total as f64).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix_to_full_file_name() {
        let request = DownloadRequest::new("m", "/src/model.gguf", "/dst/model.gguf");
        assert_eq!(request.part_path(), PathBuf::from("/dst/model.gguf.part"));
    }

    #[test]
    fn parse_dispatches_by_scheme() {
        assert!(matches!(
            DownloadSource::parse("https://example.com/a.zip").unwrap(),
            DownloadSource::Remote(_)
        ));
        assert_eq!(
            DownloadSource::parse("/tmp/a.zip").unwrap(),
            DownloadSource::LocalFile(PathBuf::from("/tmp/a.zip"))
        );
        assert_eq!(
            DownloadSource::parse("file:///tmp/a.zip").unwrap(),
            DownloadSource::LocalFile(PathBuf::from("/tmp/a.zip"))
        );
        let err = DownloadSource::parse("ftp://example.com/a.zip").unwrap_err();
        assert!(matches!(err, DownloadError::UnsupportedScheme(ref s) if s == "ftp"));
    }

    #[test]
    fn fraction_is_indeterminate_without_total() {
        let event = DownloadEvent::Progress {
            bytes_written: 10,
            total_bytes: 0,
        };
        assert_eq!(event.fraction(), None);

        let event = DownloadEvent::Progress {
            bytes_written: 25,
            total_bytes: 100,
        };
        assert_eq!(event.fraction(), Some(0.25));
    }

    #[test]
    fn events_serialize_with_camel_case_tags() {
        let event = DownloadEvent::Started {
            resumed_bytes: 4,
            total_bytes: 8,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "started", "resumedBytes": 4, "totalBytes": 8})
        );
    }
}
