//! Runtime endpoint, on-disk layout and health policy

use directories::{BaseDirs, ProjectDirs};
use resume_dl::DownloadOptions;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Placeholders substituted into `extract_args`
pub const ARCHIVE_PLACEHOLDER: &str = "{archive}";
pub const DEST_PLACEHOLDER: &str = "{dest}";
/// Placeholder substituted into `open_args`
pub const BUNDLE_PLACEHOLDER: &str = "{bundle}";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid runtime URL `{value}`: {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid runtime configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub base_url: String,
    pub health_path: String,
    pub pull_path: String,
    pub create_path: String,
    pub tags_path: String,
    /// Timeout for a single health probe
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    /// Maximum idle time between reads of a streaming response
    pub read_timeout: Duration,
    pub layout: RuntimeLayout,
    pub health: HealthPolicy,
    pub download: DownloadOptions,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            health_path: "/api/version".to_string(),
            pull_path: "/api/pull".to_string(),
            create_path: "/api/create".to_string(),
            tags_path: "/api/tags".to_string(),
            probe_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(120),
            layout: RuntimeLayout::default(),
            health: HealthPolicy::default(),
            download: DownloadOptions::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `OLLAMA_HOST`, `RUNTIME_PRIVATE_ROOT` and `RUNTIME_ARCHIVE_URL`.
    pub fn from_env() -> Self {
        Self::default().with_env(|key| env::var(key).ok())
    }

    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("OLLAMA_HOST").filter(|v| !v.trim().is_empty()) {
            self.base_url = normalize_host(&host);
        }
        if let Some(root) = lookup("RUNTIME_PRIVATE_ROOT").filter(|v| !v.trim().is_empty()) {
            self.layout.private_root = PathBuf::from(root);
        }
        if let Some(url) = lookup("RUNTIME_ARCHIVE_URL").filter(|v| !v.trim().is_empty()) {
            self.layout.archive_url = url;
        }
        self
    }

    /// Resolve `path` against `base_url`.
    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        let base = Url::parse(&self.base_url).map_err(|source| ConfigError::InvalidUrl {
            value: self.base_url.clone(),
            source,
        })?;
        base.join(path).map_err(|source| ConfigError::InvalidUrl {
            value: path.to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for path in [
            &self.health_path,
            &self.pull_path,
            &self.create_path,
            &self.tags_path,
        ] {
            self.endpoint(path)?;
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Invalid("probe_timeout must be non-zero".into()));
        }
        self.health.validate()?;
        self.download
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// `OLLAMA_HOST` is commonly given as `host:port` without a scheme.
fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Where the runtime bundle lives and how it is unpacked and opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLayout {
    /// Directory name of the application bundle, e.g. `Ollama.app`
    pub bundle_name: String,
    /// Server executable, relative to the bundle root
    pub server_executable: PathBuf,
    pub server_args: Vec<String>,
    /// Process name used for best-effort kills on restart
    pub process_name: String,
    /// Directories searched, in order, for an installed bundle
    pub install_locations: Vec<PathBuf>,
    /// Holds the downloaded archive and the scratch extraction directory
    pub private_root: PathBuf,
    /// User-private applications directory the bundle is installed into
    pub applications_dir: PathBuf,
    pub archive_url: String,
    pub archive_file_name: String,
    pub extract_program: String,
    pub extract_args: Vec<String>,
    pub open_program: String,
    pub open_args: Vec<String>,
}

impl Default for RuntimeLayout {
    fn default() -> Self {
        let home = BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(env::temp_dir);
        let private_root = ProjectDirs::from("com", "LocalRuntime", "RuntimeProvision")
            .map(|dirs| dirs.data_dir().join("runtime"))
            .unwrap_or_else(|| home.join(".runtime-provision"));
        let applications_dir = home.join("Applications");

        let (extract_program, extract_args) = default_extract_command();
        let (open_program, open_args) = default_open_command();

        Self {
            bundle_name: "Ollama.app".to_string(),
            server_executable: PathBuf::from("Contents/Resources/ollama"),
            server_args: vec!["serve".to_string()],
            process_name: "ollama".to_string(),
            install_locations: vec![applications_dir.clone(), PathBuf::from("/Applications")],
            private_root,
            applications_dir,
            archive_url: "https://ollama.com/download/Ollama-darwin.zip".to_string(),
            archive_file_name: "Ollama-darwin.zip".to_string(),
            extract_program,
            extract_args,
            open_program,
            open_args,
        }
    }
}

impl RuntimeLayout {
    pub fn archive_path(&self) -> PathBuf {
        self.private_root.join(&self.archive_file_name)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.private_root.join("extract")
    }

    pub fn server_path(&self, bundle: &Path) -> PathBuf {
        bundle.join(&self.server_executable)
    }

    pub(crate) fn extract_args_for(&self, archive: &Path, dest: &Path) -> Vec<String> {
        let archive = archive.to_string_lossy();
        let dest = dest.to_string_lossy();
        self.extract_args
            .iter()
            .map(|arg| {
                arg.replace(ARCHIVE_PLACEHOLDER, &archive)
                    .replace(DEST_PLACEHOLDER, &dest)
            })
            .collect()
    }

    pub(crate) fn open_args_for(&self, bundle: &Path) -> Vec<String> {
        let bundle = bundle.to_string_lossy();
        self.open_args
            .iter()
            .map(|arg| arg.replace(BUNDLE_PLACEHOLDER, &bundle))
            .collect()
    }
}

#[cfg(target_os = "macos")]
fn default_extract_command() -> (String, Vec<String>) {
    (
        "ditto".to_string(),
        vec!["-x", "-k", ARCHIVE_PLACEHOLDER, DEST_PLACEHOLDER]
            .into_iter()
            .map(String::from)
            .collect(),
    )
}

#[cfg(not(target_os = "macos"))]
fn default_extract_command() -> (String, Vec<String>) {
    (
        "unzip".to_string(),
        vec!["-q", "-o", ARCHIVE_PLACEHOLDER, "-d", DEST_PLACEHOLDER]
            .into_iter()
            .map(String::from)
            .collect(),
    )
}

#[cfg(target_os = "macos")]
fn default_open_command() -> (String, Vec<String>) {
    (
        "open".to_string(),
        vec!["-a".to_string(), BUNDLE_PLACEHOLDER.to_string()],
    )
}

#[cfg(not(target_os = "macos"))]
fn default_open_command() -> (String, Vec<String>) {
    ("xdg-open".to_string(), vec![BUNDLE_PLACEHOLDER.to_string()])
}

/// Exponential backoff between health polls, bounded by a deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Deadline for a plain start of an installed runtime
    pub start_deadline: Duration,
    /// Deadline after a cold install, which includes first-run initialization
    pub install_deadline: Duration,
    /// How long a freshly spawned server must survive to count as launched
    pub launch_grace: Duration,
    /// How long to wait for a terminated server to exit
    pub terminate_timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(2),
            multiplier: 2.0,
            start_deadline: Duration::from_secs(20),
            install_deadline: Duration::from_secs(90),
            launch_grace: Duration::from_millis(750),
            terminate_timeout: Duration::from_secs(5),
        }
    }
}

impl HealthPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "initial_interval must be non-zero".into(),
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(ConfigError::Invalid(
                "max_interval must be at least initial_interval".into(),
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(ConfigError::Invalid("multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OLLAMA_HOST", "0.0.0.0:9999"),
            ("RUNTIME_PRIVATE_ROOT", "/var/tmp/rt"),
        ]);
        let config =
            RuntimeConfig::default().with_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.base_url, "http://0.0.0.0:9999");
        assert_eq!(config.layout.private_root, PathBuf::from("/var/tmp/rt"));
        assert_eq!(
            config.layout.archive_url,
            RuntimeLayout::default().archive_url
        );
    }

    #[test]
    fn endpoints_join_onto_base_url() {
        let config = RuntimeConfig {
            base_url: "http://localhost:11434/".to_string(),
            ..RuntimeConfig::default()
        };
        assert_eq!(
            config.endpoint(&config.pull_path).unwrap().as_str(),
            "http://localhost:11434/api/pull"
        );
        config.validate().unwrap();
    }

    #[test]
    fn invalid_base_url_fails_validation() {
        let config = RuntimeConfig {
            base_url: "not a url".to_string(),
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn extract_args_substitute_placeholders() {
        let layout = RuntimeLayout {
            extract_args: vec!["-xf".into(), "{archive}".into(), "-C".into(), "{dest}".into()],
            ..RuntimeLayout::default()
        };
        assert_eq!(
            layout.extract_args_for(Path::new("/a/b.tar"), Path::new("/tmp/x")),
            vec!["-xf", "/a/b.tar", "-C", "/tmp/x"]
        );
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"base_url": "http://10.0.0.2:11434"}"#).unwrap();
        assert_eq!(config.base_url, "http://10.0.0.2:11434");
        assert_eq!(config.health_path, "/api/version");
        assert_eq!(config.layout.bundle_name, "Ollama.app");
    }
}
