use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid download configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported source scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("unexpected status {status} from {url}")]
    InvalidStatus { status: u16, url: String },

    #[error("source unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),

    #[error("download manager dropped while the transfer was running")]
    ManagerDropped,

    #[error("partial file missing before finalize: {}", .0.display())]
    CorruptedResumeState(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    /// Network-level failures that are worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
