use serde_json::json;

use super::{spawn_transfer, ActiveSlot, TransferKind, TransferStream};
use crate::client::RuntimeClient;

/// Asks the runtime to fetch a model from its registry.
pub struct PullClient {
    client: RuntimeClient,
    active: ActiveSlot,
}

impl PullClient {
    pub fn new(client: RuntimeClient) -> Self {
        Self {
            client,
            active: ActiveSlot::default(),
        }
    }

    /// Start pulling `model`, finishing any pull this client already runs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn pull(&self, model: &str) -> TransferStream {
        let body = json!({ "name": model, "stream": true });
        spawn_transfer(
            &self.client,
            &self.active,
            TransferKind::Pull,
            model.to_string(),
            self.client.pull_url().clone(),
            body,
        )
    }

    /// Stop the running pull. Returns `false` when nothing was running.
    pub fn cancel(&self) -> bool {
        self.active.cancel()
    }
}
