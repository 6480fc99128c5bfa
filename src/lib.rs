//! Provisioning core for a local inference runtime
//!
//! - [`RuntimeProvisioner`]: probe, start, restart and cold-install the runtime
//! - [`PullClient`] / [`ImportClient`]: drive the runtime's NDJSON model transfers
//! - [`verify`]: SHA-256 checks for downloaded artifacts
//! - [`resume_dl`]: the resumable download engine everything above builds on

mod artifact;
mod client;
mod config;
mod error;
mod provision;
mod transfer;
pub mod verify;

pub use artifact::{fetch_verified, ArtifactError};
pub use client::{ModelSummary, RuntimeClient};
pub use config::{ConfigError, HealthPolicy, RuntimeConfig, RuntimeLayout, DEFAULT_BASE_URL};
pub use error::{Classify, ErrorClass};
pub use provision::{Launch, ProvisionError, RuntimeProvisioner, ARCHIVE_DOWNLOAD_ID};
pub use transfer::{
    ImportClient, ProgressLine, PullClient, TransferError, TransferEvent, TransferOutcome,
    TransferStream,
};
pub use verify::{ArtifactChecksum, ChecksumAlgorithm, VerifyError};

pub use resume_dl;
pub use resume_dl::{
    DownloadError, DownloadEvent, DownloadManager, DownloadOptions, DownloadOutcome,
    DownloadRequest, DownloadStream,
};
