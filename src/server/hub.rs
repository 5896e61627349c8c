//! Shared server state: every compiler manager by configuration name,
//! plus a session table for the clients that have checked in.
//!
//! The hub owns the reconciliation answer. Given a client's live hash it
//! decides between the three update verdicts and keeps the session record
//! fresh as a side effect.

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use super::ServerError;
use crate::ids::{BuildHash, ClientId};
use crate::logger::Logger;
use crate::manager::CompilerManager;
use crate::protocol::{UpdateRequest, UpdateResponse};
use crate::transport::http::content_type_for;

/// What the server remembers about one client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub configuration: String,
    pub last_hash: BuildHash,
    pub last_seen: Instant,
}

/// A built asset ready to serve over HTTP.
#[derive(Clone)]
pub struct AssetContent {
    pub content_type: &'static str,
    pub bytes: Arc<Vec<u8>>,
}

pub struct CompilerHub {
    log: Logger,
    managers: FxHashMap<String, Arc<CompilerManager>>,
    sessions: DashMap<ClientId, ClientSession>,
}

impl fmt::Debug for CompilerHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerHub").finish_non_exhaustive()
    }
}

impl CompilerHub {
    pub fn new(
        log: &Logger,
        managers: Vec<Arc<CompilerManager>>,
    ) -> Result<Self, ServerError> {
        let mut by_name: FxHashMap<String, Arc<CompilerManager>> = FxHashMap::default();
        for manager in managers {
            let name = manager.configuration().to_string();
            if by_name.insert(name.clone(), manager).is_some() {
                return Err(ServerError::DuplicateConfiguration { name });
            }
        }
        Ok(Self {
            log: log.scoped("hub"),
            managers: by_name,
            sessions: DashMap::new(),
        })
    }

    pub fn manager(&self, configuration: &str) -> Option<&Arc<CompilerManager>> {
        self.managers.get(configuration)
    }

    pub fn configuration_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.managers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn session(&self, client_id: &ClientId) -> Option<ClientSession> {
        self.sessions.get(client_id).map(|entry| entry.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Answer one update request with the three-way verdict.
    ///
    /// An empty live hash means the client has no baseline yet; it is only
    /// compatible when the oldest retained update is a full-build record
    /// carrying no module sources.
    pub fn reconcile(&self, request: &UpdateRequest) -> UpdateResponse {
        let Some(manager) = self.managers.get(&request.configuration) else {
            self.log.warn(format!(
                "update request for unknown configuration `{}`",
                request.configuration
            ));
            return UpdateResponse::Unregistered;
        };

        let updates = manager.updates_snapshot();
        let client_id = self.resolve_client_id(request);
        let position = if request.current_hash.is_empty() {
            updates
                .first()
                .filter(|update| update.updated_module_sources.is_empty())
                .map(|_| 0)
        } else {
            updates
                .iter()
                .position(|update| update.hash == request.current_hash)
        };

        self.touch_session(client_id, &request.configuration, &request.current_hash);
        match position {
            Some(index) => {
                self.log.debug(format!(
                    "client `{client_id}` is {} updates behind on `{}`",
                    updates.len() - index - 1,
                    request.configuration
                ));
                UpdateResponse::Compatible {
                    client_id,
                    updates_to_apply: updates[index..].to_vec(),
                }
            }
            None => {
                self.log.warn(format!(
                    "hash `{}` is not in the retained history of `{}`",
                    request.current_hash, request.configuration
                ));
                UpdateResponse::Incompatible { client_id }
            }
        }
    }

    /// Resolve a built asset by its public path, waiting for the owning
    /// manager to become stable first.
    pub async fn fetch_asset(&self, request_path: &str) -> Option<AssetContent> {
        // public paths always start with the configuration name
        let configuration = request_path.trim_start_matches('/').split('/').next()?;
        let manager = self.managers.get(configuration)?;
        let mut file = manager.open_output(request_path).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).ok()?;
        Some(AssetContent {
            content_type: content_type_for(request_path),
            bytes: Arc::new(bytes),
        })
    }

    pub async fn wait_stable(&self, configuration: &str) -> bool {
        match self.managers.get(configuration) {
            Some(manager) => {
                manager.wait_stable().await;
                true
            }
            None => false,
        }
    }

    pub async fn await_hash(&self, configuration: &str, hash: &BuildHash) -> bool {
        match self.managers.get(configuration) {
            Some(manager) => {
                manager.await_hash(hash).await;
                true
            }
            None => false,
        }
    }

    fn resolve_client_id(&self, request: &UpdateRequest) -> ClientId {
        match request.client_id {
            // ids from a previous server run are not honored
            Some(id) if self.sessions.contains_key(&id) => id,
            _ => ClientId::random(),
        }
    }

    fn touch_session(&self, client_id: ClientId, configuration: &str, last_hash: &BuildHash) {
        self.sessions.insert(
            client_id,
            ClientSession {
                configuration: configuration.to_string(),
                last_hash: last_hash.clone(),
                last_seen: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::ids::ModuleId;
    use crate::logger::{Level, MemorySink};
    use crate::manager::{BackendError, BuildBackend, BuildReport};
    use crate::protocol::ModuleDelta;

    /// Backend whose every incremental delta touches one module.
    struct StubBackend;

    #[async_trait]
    impl BuildBackend for StubBackend {
        async fn incremental_delta(
            &self,
            _prior: &BuildHash,
            next: &BuildHash,
        ) -> Result<ModuleDelta, BackendError> {
            let mut delta = ModuleDelta::default();
            delta
                .sources
                .insert(ModuleId::new("app"), format!("build {next}"));
            Ok(delta)
        }
    }

    async fn hub_with_history(
        hashes: &[&str],
        history_limit: usize,
    ) -> (CompilerHub, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let log = Logger::new(sink.clone()).with_min_level(Level::Trace);
        let manager = Arc::new(CompilerManager::new(
            &log,
            "web",
            "/web/",
            "/nonexistent-output",
            Arc::new(StubBackend),
            history_limit,
        ));
        for hash in hashes {
            manager.on_build_completed(BuildReport::new(*hash)).await;
        }
        let hub = CompilerHub::new(&log, vec![manager]).unwrap();
        (hub, sink)
    }

    fn response_hashes(response: &UpdateResponse) -> Vec<BuildHash> {
        match response {
            UpdateResponse::Compatible {
                updates_to_apply, ..
            } => updates_to_apply.iter().map(|u| u.hash.clone()).collect(),
            other => panic!("expected compatible, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconcile_returns_tail_from_live_hash() {
        let (hub, _) = hub_with_history(&["h0", "h1", "h2"], 8).await;

        let response = hub.reconcile(&UpdateRequest::new("web", BuildHash::new("h1")));
        assert_eq!(
            response_hashes(&response),
            [BuildHash::new("h1"), BuildHash::new("h2")]
        );

        // the live hash at the tip still gets its own record back
        let response = hub.reconcile(&UpdateRequest::new("web", BuildHash::new("h2")));
        assert_eq!(response_hashes(&response), [BuildHash::new("h2")]);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_configuration() {
        let (hub, sink) = hub_with_history(&["h0"], 8).await;
        let response = hub.reconcile(&UpdateRequest::new("native", BuildHash::new("h0")));
        assert_eq!(response, UpdateResponse::Unregistered);
        assert!(sink.contains(Level::Warn, "unknown configuration `native`"));
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_stale_hash_is_incompatible() {
        let (hub, sink) = hub_with_history(&["h0", "h1"], 8).await;
        let response = hub.reconcile(&UpdateRequest::new("web", BuildHash::new("h9")));
        assert!(matches!(response, UpdateResponse::Incompatible { .. }));
        assert!(sink.contains(Level::Warn, "not in the retained history"));
    }

    #[tokio::test]
    async fn test_client_ids_are_minted_and_reused() {
        let (hub, _) = hub_with_history(&["h0", "h1"], 8).await;

        let first = hub.reconcile(&UpdateRequest::new("web", BuildHash::new("h1")));
        let UpdateResponse::Compatible { client_id, .. } = first else {
            panic!("expected compatible");
        };
        let session = hub.session(&client_id).unwrap();
        assert_eq!(session.configuration, "web");
        assert_eq!(session.last_hash, BuildHash::new("h1"));

        // a known id is echoed back
        let second = hub.reconcile(
            &UpdateRequest::new("web", BuildHash::new("h1")).with_client_id(client_id),
        );
        let UpdateResponse::Compatible {
            client_id: echoed, ..
        } = second
        else {
            panic!("expected compatible");
        };
        assert_eq!(echoed, client_id);
        assert_eq!(hub.session_count(), 1);

        // an id this server never minted is replaced
        let foreign = ClientId::random();
        let third = hub.reconcile(
            &UpdateRequest::new("web", BuildHash::new("h1")).with_client_id(foreign),
        );
        let UpdateResponse::Compatible {
            client_id: minted, ..
        } = third
        else {
            panic!("expected compatible");
        };
        assert_ne!(minted, foreign);
    }

    #[tokio::test]
    async fn test_empty_hash_matches_only_a_full_build_baseline() {
        let (hub, _) = hub_with_history(&["h0", "h1"], 8).await;
        let response = hub.reconcile(&UpdateRequest::new("web", BuildHash::new("")));
        assert_eq!(
            response_hashes(&response),
            [BuildHash::new("h0"), BuildHash::new("h1")]
        );
    }

    #[tokio::test]
    async fn test_empty_hash_after_prune_is_incompatible() {
        // limit 2 drops the baseline record once h2 lands
        let (hub, _) = hub_with_history(&["h0", "h1", "h2"], 2).await;
        let response = hub.reconcile(&UpdateRequest::new("web", BuildHash::new("")));
        assert!(matches!(response, UpdateResponse::Incompatible { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_configuration_names_are_rejected() {
        let sink = Arc::new(MemorySink::new());
        let log = Logger::new(sink).with_min_level(Level::Trace);
        let make = || {
            Arc::new(CompilerManager::new(
                &log,
                "web",
                "/web/",
                "/nonexistent-output",
                Arc::new(StubBackend),
                8,
            ))
        };
        let err = CompilerHub::new(&log, vec![make(), make()]).unwrap_err();
        assert!(matches!(
            err,
            ServerError::DuplicateConfiguration { name } if name == "web"
        ));
    }
}
