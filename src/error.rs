use resume_dl::DownloadError;
use serde::Serialize;

use crate::artifact::ArtifactError;
use crate::config::ConfigError;
use crate::provision::ProvisionError;
use crate::transfer::TransferError;
use crate::verify::VerifyError;

/// Coarse failure taxonomy shared by every error in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network-level failure; the runtime or origin could not be reached.
    Transport,
    /// Unexpected status or malformed response.
    Protocol,
    Verification,
    Packaging,
    /// Error reported in-band by the runtime.
    Runtime,
    Configuration,
    Io,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transport)
    }

    /// Failures the user has to act on (re-download, retry the install).
    pub fn requires_user_action(self) -> bool {
        matches!(self, Self::Verification | Self::Packaging)
    }
}

pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for DownloadError {
    fn class(&self) -> ErrorClass {
        match self {
            DownloadError::InvalidConfig(_) | DownloadError::UnsupportedScheme(_) => {
                ErrorClass::Configuration
            }
            DownloadError::SourceNotFound(_) | DownloadError::Io { .. } => ErrorClass::Io,
            DownloadError::InvalidStatus { .. } => ErrorClass::Protocol,
            DownloadError::Unavailable(_) | DownloadError::ManagerDropped => {
                ErrorClass::Transport
            }
            DownloadError::CorruptedResumeState(_) => ErrorClass::Io,
        }
    }
}

impl Classify for VerifyError {
    fn class(&self) -> ErrorClass {
        match self {
            VerifyError::Io { .. } => ErrorClass::Io,
            _ => ErrorClass::Verification,
        }
    }
}

impl Classify for TransferError {
    fn class(&self) -> ErrorClass {
        match self {
            TransferError::Unavailable(_) => ErrorClass::Transport,
            TransferError::InvalidStatus { .. } | TransferError::MalformedLine { .. } => {
                ErrorClass::Protocol
            }
            TransferError::Runtime(_) => ErrorClass::Runtime,
        }
    }
}

impl Classify for ProvisionError {
    fn class(&self) -> ErrorClass {
        match self {
            ProvisionError::Download(e) => e.class(),
            ProvisionError::Cancelled => ErrorClass::Transport,
            ProvisionError::Extraction { .. } | ProvisionError::BundleMissing { .. } => {
                ErrorClass::Packaging
            }
            ProvisionError::NotReachable { .. } => ErrorClass::Transport,
            ProvisionError::Launch(_) | ProvisionError::Io { .. } => ErrorClass::Io,
            ProvisionError::NotInstalled | ProvisionError::Config(_) => ErrorClass::Configuration,
        }
    }
}

impl Classify for ArtifactError {
    fn class(&self) -> ErrorClass {
        match self {
            ArtifactError::Download(e) => e.class(),
            ArtifactError::Verify(e) => e.class(),
            ArtifactError::Cancelled => ErrorClass::Transport,
        }
    }
}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}
