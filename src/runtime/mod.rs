//! Client hot-swap runtime.
//!
//! State machine driving one client: request updates from the server,
//! merge the answer into local hash history, then apply pending updates
//! strictly in build order through the host's module-replacement
//! primitive. When no delta path exists (or hot swapping is off) it
//! escalates to an application restart instead.
//!
//! ```text
//! Idle -> Requesting -> Merging -> Swapping -> Idle
//!             │             │          │
//!       (unregistered) (violation)  (abort)
//!             v             v          v
//!           Idle          Idle     Restarting
//! ```

mod history;
mod host;


pub use history::{HashHistory, MergeError};
pub use host::{HostError, HostStatus, MemoryHost, ModuleHost};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;

use crate::client::commands::ClientCommands;
use crate::ids::{BuildHash, ClientId, ModuleId};
use crate::logger::Logger;
use crate::protocol::{Update, UpdateRequest, UpdateResponse};
use crate::registry::ModuleHandle;

/// Externally observable runtime phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Requesting,
    Merging,
    Swapping,
    Restarting,
}

/// Behavior switches for one runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Apply updates in place; when false every new update escalates to
    /// an application restart.
    pub hot_swap: bool,
    /// Bound on one update request round trip.
    pub request_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            hot_swap: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Fatal conditions in the swap machinery.
///
/// Any of these leaves the in-flight guard raised, so no further swap can
/// start in this process; recovery is an application restart.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("a hot swap is already in flight")]
    AlreadyInFlight,
    #[error("hot swap started with no pending updates")]
    NothingPending,
    #[error("live hash {live} does not match history position {expected}")]
    HashDesync { live: BuildHash, expected: BuildHash },
    #[error("module host reports `{status}`; refusing to apply")]
    HostBusy { status: HostStatus },
    #[error("pending hash {hash} has no stored update")]
    MissingPending { hash: BuildHash },
    #[error("module apply failed")]
    Apply {
        #[source]
        source: HostError,
        /// Whether the failure escalated to a restart request.
        escalated: bool,
    },
}

/// Client-side hot swap state machine.
///
/// Owned by a single worker task; methods take `&mut self`, and the
/// in-flight counter still guards against re-entry bugs independently.
pub struct HotSwapRuntime {
    log: Logger,
    configuration: String,
    options: RuntimeOptions,
    commands: ModuleHandle<ClientCommands>,
    host: Arc<dyn ModuleHost>,
    history: HashHistory,
    client_id: Option<ClientId>,
    in_flight_swaps: u32,
    phase: Phase,
}

impl HotSwapRuntime {
    pub fn new(
        log: &Logger,
        configuration: impl Into<String>,
        options: RuntimeOptions,
        commands: ModuleHandle<ClientCommands>,
        host: Arc<dyn ModuleHost>,
    ) -> Self {
        let initial = host.current_hash();
        Self {
            log: log.scoped("hot-runtime"),
            configuration: configuration.into(),
            options,
            commands,
            host,
            history: HashHistory::new(initial),
            client_id: None,
            in_flight_swaps: 0,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn history(&self) -> &HashHistory {
        &self.history
    }

    /// Ask the server what changed since the live hash and act on the
    /// answer. Transport failures and timeouts are logged and leave the
    /// runtime idle with nothing applied.
    pub async fn trigger_update_request(&mut self) -> Result<(), SwapError> {
        self.phase = Phase::Requesting;
        let mut request = UpdateRequest::new(&self.configuration, self.host.current_hash());
        if let Some(client_id) = self.client_id {
            request = request.with_client_id(client_id);
        }
        self.log
            .debug(format!("requesting updates since `{}`", request.current_hash));

        let table = self.commands.table().await;
        let outcome = timeout(
            self.options.request_timeout,
            table.send_request.execute(request),
        )
        .await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.log.error(format!("update request failed: {err:#}"));
                self.phase = Phase::Idle;
                return Ok(());
            }
            Err(_) => {
                self.log.error(format!(
                    "update request timed out after {:?}",
                    self.options.request_timeout
                ));
                self.phase = Phase::Idle;
                return Ok(());
            }
        };
        self.handle_update_response(response).await
    }

    /// Act on one server response.
    pub async fn handle_update_response(
        &mut self,
        response: UpdateResponse,
    ) -> Result<(), SwapError> {
        match response {
            UpdateResponse::Unregistered => {
                self.log.fatal(format!(
                    "configuration `{}` is not registered on the server; check the client setup",
                    self.configuration
                ));
                self.phase = Phase::Idle;
                Ok(())
            }
            UpdateResponse::Incompatible { client_id } => {
                self.client_id = Some(client_id);
                self.log.error(
                    "live hash is not in the server's retained history (server restarted?); \
                     requesting application restart",
                );
                self.request_restart().await;
                Ok(())
            }
            UpdateResponse::Compatible {
                client_id,
                updates_to_apply,
            } => {
                self.client_id = Some(client_id);
                self.on_compatible(updates_to_apply).await
            }
        }
    }

    async fn on_compatible(&mut self, updates_to_apply: Vec<Update>) -> Result<(), SwapError> {
        self.phase = Phase::Merging;
        let queued = match self.history.merge(&updates_to_apply) {
            Ok(queued) => queued,
            Err(err) => {
                let received: Vec<&BuildHash> = updates_to_apply.iter().map(|u| &u.hash).collect();
                self.log.fatal(format!(
                    "server response violates the update contract: {err}; \
                     local history {:?}, received {received:?}",
                    self.history.hashes()
                ));
                self.phase = Phase::Idle;
                return Ok(());
            }
        };
        if queued.is_empty() {
            self.log.debug("already up to date");
            self.phase = Phase::Idle;
            return Ok(());
        }
        self.log.info(format!("{} new updates queued", queued.len()));

        if !self.options.hot_swap {
            self.log
                .info("hot swapping is disabled; requesting application restart");
            self.request_restart().await;
            return Ok(());
        }
        match self.in_flight_swaps {
            0 => self.hot_swap().await.map(|_| ()),
            // the active swap loop will reach the new tail on its own
            1 => Ok(()),
            n => {
                self.log
                    .fatal(format!("{n} hot swaps in flight; swap serialization is broken"));
                Err(SwapError::AlreadyInFlight)
            }
        }
    }

    /// Apply pending updates one at a time in strict history order.
    ///
    /// Every error return leaves the in-flight guard raised: the runtime
    /// is stalled and only an application restart moves this process
    /// again.
    pub async fn hot_swap(&mut self) -> Result<usize, SwapError> {
        self.in_flight_swaps += 1;
        if self.in_flight_swaps != 1 {
            self.log
                .fatal("second hot swap triggered while one is in flight");
            return Err(SwapError::AlreadyInFlight);
        }
        self.phase = Phase::Swapping;
        if self.history.is_at_tip() {
            self.log.error("hot swap started with no pending updates");
            return Err(SwapError::NothingPending);
        }

        let mut applied = 0;
        loop {
            let expected = self.history.current_hash().clone();
            let live = self.host.current_hash();
            if live != expected {
                self.log.fatal(format!(
                    "live hash `{live}` does not match history position `{expected}`; \
                     a previous swap failed silently"
                ));
                return Err(SwapError::HashDesync { live, expected });
            }
            let status = self.host.status();
            if status != HostStatus::Idle {
                self.log
                    .error(format!("module host is `{status}`; cannot apply an update now"));
                return Err(SwapError::HostBusy { status });
            }

            let next_index = self.history.current_index() + 1;
            let Some(next_hash) = self.history.hash_at(next_index).cloned() else {
                self.log.error("pending update disappeared mid-swap");
                return Err(SwapError::NothingPending);
            };
            let Some(update) = self.history.record(&next_hash).cloned() else {
                self.log
                    .fatal(format!("pending hash `{next_hash}` has no stored update"));
                return Err(SwapError::MissingPending { hash: next_hash });
            };

            self.log_pending_update(&update);
            match self.host.apply(&update).await {
                Ok(touched) => {
                    self.log_apply_outcome(&touched);
                    self.history.advance();
                    let live = self.host.current_hash();
                    let expected = self.history.current_hash().clone();
                    if live != expected {
                        self.log.fatal(format!(
                            "applied `{expected}` but the host reports `{live}`"
                        ));
                        return Err(SwapError::HashDesync { live, expected });
                    }
                    applied += 1;
                    if self.history.is_at_tip() {
                        self.in_flight_swaps -= 1;
                        self.phase = Phase::Idle;
                        self.log.info(format!("up to date at `{expected}`"));
                        return Ok(applied);
                    }
                }
                Err(err) => {
                    self.log.error(format!("module apply failed: {err}"));
                    let status = self.host.status();
                    let escalated = status == HostStatus::Abort;
                    if escalated {
                        self.log
                            .error("module host aborted; requesting application restart");
                        self.request_restart().await;
                    } else {
                        self.log.error(format!(
                            "module host reports `{status}`; runtime stalled until restart"
                        ));
                    }
                    return Err(SwapError::Apply {
                        source: err,
                        escalated,
                    });
                }
            }
        }
    }

    async fn request_restart(&mut self) {
        self.phase = Phase::Restarting;
        let table = self.commands.table().await;
        if let Err(err) = table.restart.execute(()).await {
            self.log.error(format!("restart command failed: {err:#}"));
        }
        self.phase = Phase::Idle;
    }

    fn log_pending_update(&self, update: &Update) {
        if !update.manifest.removed_chunk_ids.is_empty() {
            self.log.debug(format!(
                "update removes chunks {:?}",
                update.manifest.removed_chunk_ids
            ));
        }
        self.log.info(format!("applying update {}", update.summary()));
    }

    fn log_apply_outcome(&self, touched: &[ModuleId]) {
        if touched.is_empty() {
            self.log.info("Nothing hot updated.");
        } else {
            let names: Vec<&str> = touched.iter().map(ModuleId::as_str).collect();
            self.log.info(format!("hot updated: {}", names.join(", ")));
        }
    }
}
