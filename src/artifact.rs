use log::{info, warn};
use resume_dl::{DownloadError, DownloadEvent, DownloadManager, DownloadOutcome, DownloadRequest};
use std::path::PathBuf;

use crate::verify::{self, ArtifactChecksum, VerifyError};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("artifact download was cancelled")]
    Cancelled,
}

/// Download `request` to completion and check it against `checksum`.
///
/// A destination that fails verification is removed. Its partial file is
/// already gone by then, so the next attempt starts from zero.
pub async fn fetch_verified<F>(
    downloads: &DownloadManager,
    request: DownloadRequest,
    checksum: &ArtifactChecksum,
    progress: F,
) -> Result<PathBuf, ArtifactError>
where
    F: FnMut(&DownloadEvent),
{
    let id = request.id.clone();
    let stream = downloads.start_download(request)?;
    let destination = match stream.completion(progress).await? {
        DownloadOutcome::Completed { destination, .. } => destination,
        DownloadOutcome::Cancelled => return Err(ArtifactError::Cancelled),
    };

    if let Err(err) = verify::verify(&destination, checksum).await {
        if let Err(e) = tokio::fs::remove_file(&destination).await {
            warn!("artifact_cleanup: {} error={}", destination.display(), e);
        }
        return Err(err.into());
    }
    info!("artifact_verified: {} digest={}", id, checksum.digest());
    Ok(destination)
}
