//! The closed command table for a client deployment.
//!
//! Four commands cover everything a client module needs to do: emit a log
//! record, send an update request to the server, request an application
//! restart, and nudge the runtime to synchronize. Each command is bound to
//! exactly one executor at composition time.

use std::fmt;
use std::sync::Arc;

use crate::logger::{LogRecord, Logger};
use crate::protocol::{UpdateRequest, UpdateResponse};
use crate::registry::command::{Command, Executor};
use crate::registry::{self, ModuleHandle, RegistryError};

/// Stable names for the client commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommandId {
    Log,
    SendRequest,
    Restart,
    Sync,
}

impl ClientCommandId {
    pub fn name(self) -> &'static str {
        match self {
            ClientCommandId::Log => "log",
            ClientCommandId::SendRequest => "send-request",
            ClientCommandId::Restart => "restart",
            ClientCommandId::Sync => "sync",
        }
    }
}

/// Every command a client module can execute.
pub struct ClientCommands {
    pub log: Command<LogRecord, ()>,
    pub send_request: Command<UpdateRequest, UpdateResponse>,
    pub restart: Command<(), ()>,
    pub sync: Command<(), ()>,
}

impl fmt::Debug for ClientCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCommands").finish_non_exhaustive()
    }
}

/// One module offering to execute one command.
pub enum ClientBinding {
    Log {
        module: ModuleHandle<ClientCommands>,
        run: Executor<LogRecord, ()>,
    },
    SendRequest {
        module: ModuleHandle<ClientCommands>,
        run: Executor<UpdateRequest, UpdateResponse>,
    },
    Restart {
        module: ModuleHandle<ClientCommands>,
        run: Executor<(), ()>,
    },
    Sync {
        module: ModuleHandle<ClientCommands>,
        run: Executor<(), ()>,
    },
}

impl ClientBinding {
    pub fn log(module: &ModuleHandle<ClientCommands>, run: Executor<LogRecord, ()>) -> Self {
        ClientBinding::Log {
            module: module.clone(),
            run,
        }
    }

    pub fn send_request(
        module: &ModuleHandle<ClientCommands>,
        run: Executor<UpdateRequest, UpdateResponse>,
    ) -> Self {
        ClientBinding::SendRequest {
            module: module.clone(),
            run,
        }
    }

    pub fn restart(module: &ModuleHandle<ClientCommands>, run: Executor<(), ()>) -> Self {
        ClientBinding::Restart {
            module: module.clone(),
            run,
        }
    }

    pub fn sync(module: &ModuleHandle<ClientCommands>, run: Executor<(), ()>) -> Self {
        ClientBinding::Sync {
            module: module.clone(),
            run,
        }
    }

    pub fn id(&self) -> ClientCommandId {
        match self {
            ClientBinding::Log { .. } => ClientCommandId::Log,
            ClientBinding::SendRequest { .. } => ClientCommandId::SendRequest,
            ClientBinding::Restart { .. } => ClientCommandId::Restart,
            ClientBinding::Sync { .. } => ClientCommandId::Sync,
        }
    }
}

pub struct ClientRegistry;

impl ClientRegistry {
    /// Build the command table from bindings and resolve every member's
    /// handle with it.
    pub fn compose(
        log: &Logger,
        bindings: Vec<ClientBinding>,
    ) -> Result<Arc<ClientCommands>, RegistryError> {
        let mut members = Vec::with_capacity(bindings.len());
        let mut log_slot = None;
        let mut send_request_slot = None;
        let mut restart_slot = None;
        let mut sync_slot = None;

        for binding in bindings {
            let id = binding.id();
            let taken = match binding {
                ClientBinding::Log { module, run } => {
                    members.push(module);
                    log_slot.replace(run).is_some()
                }
                ClientBinding::SendRequest { module, run } => {
                    members.push(module);
                    send_request_slot.replace(run).is_some()
                }
                ClientBinding::Restart { module, run } => {
                    members.push(module);
                    restart_slot.replace(run).is_some()
                }
                ClientBinding::Sync { module, run } => {
                    members.push(module);
                    sync_slot.replace(run).is_some()
                }
            };
            if taken {
                return Err(RegistryError::DuplicateExecutor { command: id.name() });
            }
        }

        let table = Arc::new(ClientCommands {
            log: Command::new(
                ClientCommandId::Log.name(),
                log,
                registry::required(log_slot, ClientCommandId::Log.name())?,
            ),
            send_request: Command::new(
                ClientCommandId::SendRequest.name(),
                log,
                registry::required(send_request_slot, ClientCommandId::SendRequest.name())?,
            ),
            restart: Command::new(
                ClientCommandId::Restart.name(),
                log,
                registry::required(restart_slot, ClientCommandId::Restart.name())?,
            ),
            sync: Command::new(
                ClientCommandId::Sync.name(),
                log,
                registry::required(sync_slot, ClientCommandId::Sync.name())?,
            ),
        });
        registry::distribute(&table, members)?;
        Ok(table)
    }
}
