//! In-process link for same-process deployments and tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::link::{LinkError, ServerLink, ServerNotice};
use crate::ids::BuildHash;
use crate::protocol::{UpdateRequest, UpdateResponse};
use crate::registry::pubsub::{PubSubError, Subscriber};
use crate::server::CompilerHub;

/// Short-circuits the update protocol straight into a hub.
pub struct LocalLink {
    hub: Arc<CompilerHub>,
}

impl LocalLink {
    pub fn new(hub: Arc<CompilerHub>) -> Arc<Self> {
        Arc::new(Self { hub })
    }

    /// Notice stream equivalent to what the websocket link surfaces: one
    /// connected notice up front, then an update notice per appended
    /// build.
    pub fn notices(
        hub: &Arc<CompilerHub>,
    ) -> Result<mpsc::UnboundedReceiver<ServerNotice>, PubSubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for name in hub.configuration_names() {
            let Some(manager) = hub.manager(name) else {
                continue;
            };
            let configuration = name.to_string();
            let tx = tx.clone();
            let forward = Subscriber::new(move |_hash: BuildHash| {
                let tx = tx.clone();
                let configuration = configuration.clone();
                async move {
                    let _ = tx.send(ServerNotice::UpdateAvailable { configuration });
                    Ok(())
                }
            });
            manager.updated().subscribe(&forward)?;
        }
        let _ = tx.send(ServerNotice::Connected);
        Ok(rx)
    }
}

#[async_trait]
impl ServerLink for LocalLink {
    async fn send_update_request(
        &self,
        request: UpdateRequest,
    ) -> Result<UpdateResponse, LinkError> {
        Ok(self.hub.reconcile(&request))
    }

    async fn ready(&self) {}
}
