//! Install, launch and health-check the local runtime
//!
//! Nothing here is persisted. Every call recomputes where things stand from
//! what is on disk and whether the health endpoint answers.

mod health;
mod install;
mod process;

use log::{info, warn};
use resume_dl::{DownloadError, DownloadEvent, DownloadManager, DownloadOutcome, DownloadRequest};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::client::RuntimeClient;
use crate::config::{ConfigError, RuntimeConfig};
use process::ProcessTracker;

/// Download identity of the runtime's distribution archive
pub const ARCHIVE_DOWNLOAD_ID: &str = "runtime-archive";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("runtime download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("runtime download was cancelled")]
    Cancelled,

    #[error("`{program}` failed to extract the runtime archive (status {status:?}): {stderr}")]
    Extraction {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("`{bundle}` not found under {}", .searched.display())]
    BundleMissing { bundle: String, searched: PathBuf },

    #[error("runtime did not become reachable within {deadline:?}")]
    NotReachable { deadline: Duration },

    #[error("failed to launch the runtime: {0}")]
    Launch(String),

    #[error("no installed runtime bundle found")]
    NotInstalled,

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProvisionError {
    pub(crate) fn io(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| Self::Io { path, source }
    }
}

/// How the runtime was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// Embedded server spawned and tracked by this process.
    Tracked { pid: u32 },
    /// Handed to the system "open application" command; not tracked.
    Opened,
}

pub struct RuntimeProvisioner {
    config: RuntimeConfig,
    client: RuntimeClient,
    downloads: Arc<DownloadManager>,
    processes: ProcessTracker,
}

impl RuntimeProvisioner {
    pub fn new(config: RuntimeConfig, downloads: Arc<DownloadManager>) -> Result<Self, ProvisionError> {
        config.validate()?;
        let client = RuntimeClient::new(&config)?;
        Ok(Self {
            config,
            client,
            downloads,
            processes: ProcessTracker::new(),
        })
    }

    /// Build with a private download manager configured from `config.download`.
    pub fn from_config(config: RuntimeConfig) -> Result<Self, ProvisionError> {
        let downloads = DownloadManager::new(config.download.clone())?;
        Self::new(config, Arc::new(downloads))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn client(&self) -> &RuntimeClient {
        &self.client
    }

    pub async fn is_reachable(&self) -> bool {
        self.client.is_reachable().await
    }

    /// First install location holding the runtime bundle.
    pub fn installed_bundle(&self) -> Option<PathBuf> {
        let layout = &self.config.layout;
        layout
            .install_locations
            .iter()
            .map(|dir| dir.join(&layout.bundle_name))
            .find(|candidate| candidate.is_dir())
    }

    /// Pid of the server process this provisioner spawned, while it runs.
    pub fn tracked_pid(&self) -> Option<u32> {
        self.processes.tracked_pid()
    }

    /// Make an installed runtime reachable. `false` when nothing is installed,
    /// the launch failed, or the start deadline passed.
    pub async fn start_if_installed(&self) -> bool {
        match self.start_installed().await {
            Ok(()) => true,
            Err(e) => {
                info!("runtime_start: {}", e);
                false
            }
        }
    }

    /// Like [`start_if_installed`](Self::start_if_installed), reporting why
    /// the runtime could not be started.
    pub async fn start_installed(&self) -> Result<(), ProvisionError> {
        if self.is_reachable().await {
            return Ok(());
        }
        let bundle = self.installed_bundle().ok_or(ProvisionError::NotInstalled)?;
        self.launch(&bundle).await?;
        let deadline = self.config.health.start_deadline;
        if !self.wait_reachable(deadline).await {
            return Err(ProvisionError::NotReachable { deadline });
        }
        Ok(())
    }

    /// Stop whatever runtime is running and start the installed one again.
    pub async fn restart_if_installed(&self) -> bool {
        if self.installed_bundle().is_none() {
            info!("runtime_restart: not_installed");
            return false;
        }
        let health = &self.config.health;
        self.processes.terminate(health.terminate_timeout).await;
        process::kill_by_name(&self.config.layout.process_name).await;

        // The old server can keep answering for a moment while it exits.
        let client = &self.client;
        let gone = health::wait_until(health, health.terminate_timeout, move || async move {
            !client.is_reachable().await
        })
        .await;
        if !gone {
            warn!("runtime_restart: previous instance still reachable");
        }
        self.start_if_installed().await
    }

    /// Stop the tracked server process, if any.
    pub async fn stop_tracked(&self) -> bool {
        self.processes
            .terminate(self.config.health.terminate_timeout)
            .await
    }

    pub async fn install_and_start(&self) -> Result<(), ProvisionError> {
        self.install_and_start_with_progress(|_| {}).await
    }

    /// Download, unpack and install the runtime, then launch it and wait for
    /// it to answer. Download events are handed to `progress`.
    pub async fn install_and_start_with_progress<F>(&self, progress: F) -> Result<(), ProvisionError>
    where
        F: FnMut(&DownloadEvent),
    {
        let layout = &self.config.layout;
        let archive = layout.archive_path();
        let scratch = layout.scratch_dir();
        tokio::fs::create_dir_all(&layout.private_root)
            .await
            .map_err(ProvisionError::io(&layout.private_root))?;

        info!("runtime_install: {} url={}", archive.display(), layout.archive_url);
        let request = DownloadRequest::new(ARCHIVE_DOWNLOAD_ID, &layout.archive_url, &archive);
        let stream = self.downloads.start_download(request)?;
        if stream.completion(progress).await? == DownloadOutcome::Cancelled {
            return Err(ProvisionError::Cancelled);
        }

        install::extract_archive(layout, &archive, &scratch).await?;
        let bundle = install::find_bundle(&scratch, &layout.bundle_name)
            .await?
            .ok_or_else(|| ProvisionError::BundleMissing {
                bundle: layout.bundle_name.clone(),
                searched: scratch.clone(),
            })?;
        let installed = install::install_bundle(&bundle, &layout.applications_dir).await?;

        for leftover in [&scratch, &archive] {
            let result = if leftover.is_dir() {
                tokio::fs::remove_dir_all(leftover).await
            } else {
                tokio::fs::remove_file(leftover).await
            };
            if let Err(e) = result {
                warn!("runtime_install_cleanup: {} error={}", leftover.display(), e);
            }
        }

        self.launch(&installed).await?;
        let deadline = self.config.health.install_deadline;
        if !self.wait_reachable(deadline).await {
            return Err(ProvisionError::NotReachable { deadline });
        }
        info!("runtime_ready: {}", installed.display());
        Ok(())
    }

    /// Launch `bundle` without waiting for it to become reachable.
    ///
    /// Prefers the embedded server as a tracked subprocess and falls back to
    /// opening the bundle when the server is missing or dies straight away.
    pub async fn launch(&self, bundle: &Path) -> Result<Launch, ProvisionError> {
        if let Some(pid) = self.processes.tracked_pid() {
            info!("runtime_launch: already_running pid={}", pid);
            return Ok(Launch::Tracked { pid });
        }

        let layout = &self.config.layout;
        let server = layout.server_path(bundle);
        if server.is_file() {
            match self
                .processes
                .spawn(&server, &layout.server_args, self.config.health.launch_grace)
                .await
            {
                Ok(Some(pid)) => {
                    info!("runtime_launch: {} pid={}", server.display(), pid);
                    return Ok(Launch::Tracked { pid });
                }
                Ok(None) => warn!("runtime_launch_fallback: {} reason=exited", server.display()),
                Err(e) => warn!("runtime_launch_fallback: {} error={}", server.display(), e),
            }
        } else {
            warn!("runtime_launch_fallback: {} reason=missing", server.display());
        }

        let status = Command::new(&layout.open_program)
            .args(layout.open_args_for(bundle))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ProvisionError::Launch(format!("{}: {}", layout.open_program, e)))?;
        if !status.success() {
            return Err(ProvisionError::Launch(format!(
                "{} exited with {}",
                layout.open_program, status
            )));
        }
        info!("runtime_launch: {} via={}", bundle.display(), layout.open_program);
        Ok(Launch::Opened)
    }

    async fn wait_reachable(&self, deadline: Duration) -> bool {
        let client = &self.client;
        health::wait_until(&self.config.health, deadline, move || client.is_reachable()).await
    }
}
