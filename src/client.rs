use log::debug;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::config::{ConfigError, RuntimeConfig};
use crate::transfer::TransferError;

/// A model already registered with the runtime (`GET /api/tags`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelSummary>,
}

/// HTTP access to the local runtime's API.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    http: Client,
    probe_timeout: Duration,
    health_url: Url,
    pull_url: Url,
    create_url: Url,
    tags_url: Url,
}

impl RuntimeClient {
    pub fn new(config: &RuntimeConfig) -> Result<Self, ConfigError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            probe_timeout: config.probe_timeout,
            health_url: config.endpoint(&config.health_path)?,
            pull_url: config.endpoint(&config.pull_path)?,
            create_url: config.endpoint(&config.create_path)?,
            tags_url: config.endpoint(&config.tags_path)?,
        })
    }

    /// Short-timeout health probe; any 2xx counts as reachable.
    pub async fn is_reachable(&self) -> bool {
        match self
            .http
            .get(self.health_url.clone())
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("runtime_probe: {} error={}", self.health_url, e);
                false
            }
        }
    }

    pub async fn list_models(&self) -> Result<Vec<ModelSummary>, TransferError> {
        let response = self
            .http
            .get(self.tags_url.clone())
            .timeout(self.probe_timeout.max(Duration::from_secs(10)))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models)
    }

    /// Whether `name` is registered; a missing tag means `:latest`.
    pub async fn has_model(&self, name: &str) -> Result<bool, TransferError> {
        let wanted = with_default_tag(name);
        Ok(self
            .list_models()
            .await?
            .iter()
            .any(|model| with_default_tag(&model.name) == wanted))
    }

    pub(crate) fn pull_url(&self) -> &Url {
        &self.pull_url
    }

    pub(crate) fn create_url(&self) -> &Url {
        &self.create_url
    }

    /// POST a JSON body and return the (still streaming) successful response.
    ///
    /// No overall timeout: pulls can run for a long time. The client's read
    /// timeout bounds every idle gap instead.
    pub(crate) async fn post_stream<T: Serialize + ?Sized>(
        &self,
        url: &Url,
        body: &T,
    ) -> Result<Response, TransferError> {
        let response = self.http.post(url.clone()).json(body).send().await?;
        ensure_success(response).await
    }
}

/// Map a non-2xx answer to an in-band runtime error when the body carries
/// `{"error": ...}`, otherwise to an invalid-status error.
async fn ensure_success(response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if let Ok(ErrorBody { error: Some(message) }) = serde_json::from_str::<ErrorBody>(&body) {
        return Err(TransferError::Runtime(message));
    }
    Err(TransferError::InvalidStatus {
        status: status.as_u16(),
        body,
    })
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

fn with_default_tag(name: &str) -> String {
    let name = name.trim();
    // A ':' in the last path segment is a tag; one before a '/' is a registry port.
    let last_segment = name.rsplit('/').next().unwrap_or(name);
    if last_segment.contains(':') {
        name.to_string()
    } else {
        format!("{}:latest", name)
    }
}
