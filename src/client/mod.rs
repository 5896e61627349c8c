//! Client deployment assembly.
//!
//! [`HotClient`] composes the four client modules around one
//! [`HotSwapRuntime`]:
//!
//! ```text
//!  server notices ──> sync command ──> runtime worker
//!                                          │ send-request (gated on link.ready)
//!                                          ▼
//!                                     ServerLink ──> server
//!                                          │
//!                        restart command ──> ApplicationRestarter
//! ```
//!
//! The runtime lives on a single worker task; sync requests are queued
//! and handled strictly one at a time, which is what keeps hot swaps
//! serialized.

pub mod commands;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use self::commands::{ClientBinding, ClientCommands, ClientRegistry};
use crate::config::ClientOptions;
use crate::logger::{ConsoleSink, LogRecord, Logger, LogSink, QueueSink};
use crate::protocol::UpdateRequest;
use crate::registry::ModuleHandle;
use crate::registry::command::executor;
use crate::registry::pubsub::Subscriber;
use crate::restart::{ApplicationRestarter, RestartAction};
use crate::runtime::{HotSwapRuntime, ModuleHost, RuntimeOptions};
use crate::transport::{ServerLink, ServerNotice};

const CHANNEL_BUFFER: usize = 32;

enum WorkerMsg {
    Sync,
    Shutdown,
}

pub struct HotClient {
    log: Logger,
    commands: Arc<ClientCommands>,
    worker_tx: mpsc::Sender<WorkerMsg>,
    worker: JoinHandle<()>,
}

impl HotClient {
    pub fn connect(
        options: &ClientOptions,
        configuration: impl Into<String>,
        link: Arc<dyn ServerLink>,
        notices: mpsc::UnboundedReceiver<ServerNotice>,
        host: Arc<dyn ModuleHost>,
        restart_action: Arc<dyn RestartAction>,
    ) -> anyhow::Result<Self> {
        Self::with_sink(
            Arc::new(ConsoleSink),
            options,
            configuration,
            link,
            notices,
            host,
            restart_action,
        )
    }

    /// Assemble the client with an explicit terminal log sink.
    #[allow(clippy::too_many_arguments)]
    pub fn with_sink(
        sink: Arc<dyn LogSink>,
        options: &ClientOptions,
        configuration: impl Into<String>,
        link: Arc<dyn ServerLink>,
        mut notices: mpsc::UnboundedReceiver<ServerNotice>,
        host: Arc<dyn ModuleHost>,
        restart_action: Arc<dyn RestartAction>,
    ) -> anyhow::Result<Self> {
        let configuration = configuration.into();
        let (queue, mut records) = QueueSink::channel();
        let log = Logger::new(Arc::new(queue))
            .with_min_level(options.log_level())
            .scoped("client");

        let logger_module = ModuleHandle::new("logger");
        let link_module = ModuleHandle::new("server-link");
        let restarter_module = ModuleHandle::new("restarter");
        let runtime_module = ModuleHandle::new("hot-runtime");

        let restarter = Arc::new(ApplicationRestarter::new(
            &log,
            options.restart,
            restart_action,
        ));
        let (worker_tx, mut worker_rx) = mpsc::channel(CHANNEL_BUFFER);

        let bindings = vec![
            ClientBinding::log(
                &logger_module,
                executor(move |record: LogRecord| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.submit(record);
                        Ok(())
                    }
                }),
            ),
            ClientBinding::send_request(&link_module, {
                let link = Arc::clone(&link);
                executor(move |request: UpdateRequest| {
                    let link = Arc::clone(&link);
                    async move {
                        link.send_update_request(request)
                            .await
                            .map_err(anyhow::Error::from)
                    }
                })
            }),
            ClientBinding::restart(&restarter_module, {
                let restarter = Arc::clone(&restarter);
                executor(move |()| {
                    let restarter = Arc::clone(&restarter);
                    async move {
                        restarter.restart_or_prompt().await;
                        Ok(())
                    }
                })
            }),
            ClientBinding::sync(&runtime_module, {
                let tx = worker_tx.clone();
                executor(move |()| {
                    let tx = tx.clone();
                    async move {
                        tx.send(WorkerMsg::Sync)
                            .await
                            .map_err(|_| anyhow::anyhow!("runtime worker is gone"))
                    }
                })
            }),
        ];
        let commands = ClientRegistry::compose(&log, bindings)?;

        // requests wait for the link to come up instead of failing cold
        let gate = {
            let link = Arc::clone(&link);
            Subscriber::new(move |_request: UpdateRequest| {
                let link = Arc::clone(&link);
                async move {
                    link.ready().await;
                    Ok(())
                }
            })
        };
        commands.send_request.subscribe_pre(&gate)?;

        let pump_table = Arc::clone(&commands);
        tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                let _ = pump_table.log.execute(record).await;
            }
        });

        let runtime_options = RuntimeOptions {
            hot_swap: options.hot_swap,
            request_timeout: options.request_timeout(),
        };
        let mut runtime = HotSwapRuntime::new(
            &log,
            configuration.clone(),
            runtime_options,
            runtime_module,
            host,
        );
        let worker_log = log.clone();
        let worker = tokio::spawn(async move {
            while let Some(message) = worker_rx.recv().await {
                match message {
                    WorkerMsg::Sync => {
                        if let Err(err) = runtime.trigger_update_request().await {
                            // latched inside the runtime; further syncs
                            // merge history but apply nothing
                            worker_log.fatal(format!("hot swap runtime error: {err}"));
                        }
                    }
                    WorkerMsg::Shutdown => break,
                }
            }
        });

        let notice_table = Arc::clone(&commands);
        let notice_log = log.clone();
        let notice_configuration = configuration.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let relevant = match &notice {
                    ServerNotice::Connected => true,
                    ServerNotice::UpdateAvailable { configuration } => {
                        *configuration == notice_configuration
                    }
                };
                if !relevant {
                    continue;
                }
                if let Err(err) = notice_table.sync.execute(()).await {
                    notice_log.error(format!("sync dispatch failed: {err:#}"));
                }
            }
        });

        // one sync at startup covers links that never announce themselves
        let startup_table = Arc::clone(&commands);
        tokio::spawn(async move {
            let _ = startup_table.sync.execute(()).await;
        });

        Ok(Self {
            log,
            commands,
            worker_tx,
            worker,
        })
    }

    pub fn commands(&self) -> &Arc<ClientCommands> {
        &self.commands
    }

    /// Queue one update check without waiting for it.
    pub fn trigger_sync(&self) {
        if self.worker_tx.try_send(WorkerMsg::Sync).is_err() {
            self.log
                .warn("sync dropped; runtime worker queue is full or closed");
        }
    }

    /// Stop the runtime worker and wait for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.worker_tx.send(WorkerMsg::Shutdown).await;
        let _ = self.worker.await;
    }
}
