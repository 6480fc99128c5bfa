use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DownloadError;

/// Chunk size for copies and buffered writes (2 MB)
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    /// Maximum idle time between body reads; large transfers have no overall deadline.
    pub read_timeout: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
        }
    }
}

impl DownloadOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        validate_chunk_size(self.chunk_size)?;
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(DownloadError::InvalidConfig(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_chunk_size(chunk_size: usize) -> Result<(), DownloadError> {
    if chunk_size == 0 {
        return Err(DownloadError::InvalidConfig(
            "chunk size must be at least 1 byte".to_string(),
        ));
    }
    Ok(())
}
