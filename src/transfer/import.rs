use serde_json::json;
use std::path::Path;

use super::{spawn_transfer, ActiveSlot, TransferKind, TransferStream};
use crate::client::RuntimeClient;

/// Registers a model file already on disk with the runtime.
///
/// Ingestion reports status text only, never byte progress.
pub struct ImportClient {
    client: RuntimeClient,
    active: ActiveSlot,
}

impl ImportClient {
    pub fn new(client: RuntimeClient) -> Self {
        Self {
            client,
            active: ActiveSlot::default(),
        }
    }

    /// Create `model` from the file at `from`, finishing any import this
    /// client already runs.
    pub fn import(&self, model: &str, from: &Path) -> TransferStream {
        let body = json!({
            "model": model,
            "from": from.to_string_lossy(),
            "stream": true,
        });
        spawn_transfer(
            &self.client,
            &self.active,
            TransferKind::Import,
            model.to_string(),
            self.client.create_url().clone(),
            body,
        )
    }

    pub fn cancel(&self) -> bool {
        self.active.cancel()
    }
}
