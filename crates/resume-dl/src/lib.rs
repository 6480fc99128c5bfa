//! Resumable download engine
//!
//! Transfers a local file or an HTTP(S) resource into a destination path with:
//! - One cooperative task per identity, superseded by a restart under the same id
//! - Resume from `<destination>.part` (ranged requests for remote sources)
//! - Ordered `started` / `progress` / `completed` events as an async stream
//! - Atomic promotion of the partial file once the transfer finishes

mod config;
mod error;
mod manager;
mod types;
mod worker;

pub use config::{DownloadOptions, DEFAULT_CHUNK_SIZE};
pub use error::DownloadError;
pub use manager::{DownloadManager, DownloadOutcome, DownloadStream};
pub use types::{DownloadEvent, DownloadRequest, DownloadSource, PART_SUFFIX};
