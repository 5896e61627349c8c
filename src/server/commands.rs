//! The closed command table for a server deployment.
//!
//! Three commands: emit a log record, reconcile an update request against
//! the retained histories, and fetch a built asset. The transport gateways
//! only ever touch server state through this table.

use std::fmt;
use std::sync::Arc;

use super::AssetContent;
use crate::logger::{LogRecord, Logger};
use crate::protocol::{UpdateRequest, UpdateResponse};
use crate::registry::command::{Command, Executor};
use crate::registry::{self, ModuleHandle, RegistryError};

/// Stable names for the server commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommandId {
    Log,
    Reconcile,
    FetchAsset,
}

impl ServerCommandId {
    pub fn name(self) -> &'static str {
        match self {
            ServerCommandId::Log => "log",
            ServerCommandId::Reconcile => "reconcile",
            ServerCommandId::FetchAsset => "fetch-asset",
        }
    }
}

/// Payload for the asset command: a public request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub path: String,
}

impl AssetRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Every command a server module can execute.
pub struct ServerCommands {
    pub log: Command<LogRecord, ()>,
    pub reconcile: Command<UpdateRequest, UpdateResponse>,
    pub fetch_asset: Command<AssetRequest, Option<AssetContent>>,
}

impl fmt::Debug for ServerCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCommands").finish_non_exhaustive()
    }
}

/// One module offering to execute one command.
pub enum ServerBinding {
    Log {
        module: ModuleHandle<ServerCommands>,
        run: Executor<LogRecord, ()>,
    },
    Reconcile {
        module: ModuleHandle<ServerCommands>,
        run: Executor<UpdateRequest, UpdateResponse>,
    },
    FetchAsset {
        module: ModuleHandle<ServerCommands>,
        run: Executor<AssetRequest, Option<AssetContent>>,
    },
}

impl ServerBinding {
    pub fn log(module: &ModuleHandle<ServerCommands>, run: Executor<LogRecord, ()>) -> Self {
        ServerBinding::Log {
            module: module.clone(),
            run,
        }
    }

    pub fn reconcile(
        module: &ModuleHandle<ServerCommands>,
        run: Executor<UpdateRequest, UpdateResponse>,
    ) -> Self {
        ServerBinding::Reconcile {
            module: module.clone(),
            run,
        }
    }

    pub fn fetch_asset(
        module: &ModuleHandle<ServerCommands>,
        run: Executor<AssetRequest, Option<AssetContent>>,
    ) -> Self {
        ServerBinding::FetchAsset {
            module: module.clone(),
            run,
        }
    }

    pub fn id(&self) -> ServerCommandId {
        match self {
            ServerBinding::Log { .. } => ServerCommandId::Log,
            ServerBinding::Reconcile { .. } => ServerCommandId::Reconcile,
            ServerBinding::FetchAsset { .. } => ServerCommandId::FetchAsset,
        }
    }
}

pub struct ServerRegistry;

impl ServerRegistry {
    /// Build the command table from bindings and resolve every member's
    /// handle with it.
    pub fn compose(
        log: &Logger,
        bindings: Vec<ServerBinding>,
    ) -> Result<Arc<ServerCommands>, RegistryError> {
        let mut members = Vec::with_capacity(bindings.len());
        let mut log_slot = None;
        let mut reconcile_slot = None;
        let mut fetch_asset_slot = None;

        for binding in bindings {
            let id = binding.id();
            let taken = match binding {
                ServerBinding::Log { module, run } => {
                    members.push(module);
                    log_slot.replace(run).is_some()
                }
                ServerBinding::Reconcile { module, run } => {
                    members.push(module);
                    reconcile_slot.replace(run).is_some()
                }
                ServerBinding::FetchAsset { module, run } => {
                    members.push(module);
                    fetch_asset_slot.replace(run).is_some()
                }
            };
            if taken {
                return Err(RegistryError::DuplicateExecutor { command: id.name() });
            }
        }

        let table = Arc::new(ServerCommands {
            log: Command::new(
                ServerCommandId::Log.name(),
                log,
                registry::required(log_slot, ServerCommandId::Log.name())?,
            ),
            reconcile: Command::new(
                ServerCommandId::Reconcile.name(),
                log,
                registry::required(reconcile_slot, ServerCommandId::Reconcile.name())?,
            ),
            fetch_asset: Command::new(
                ServerCommandId::FetchAsset.name(),
                log,
                registry::required(fetch_asset_slot, ServerCommandId::FetchAsset.name())?,
            ),
        });
        registry::distribute(&table, members)?;
        Ok(table)
    }
}
