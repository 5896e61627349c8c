//! Server deployment assembly.
//!
//! [`HotServer`] wires one [`CompilerManager`] per build configuration to
//! the command table and the transport gateways:
//!
//! ```text
//!  build tool ──BuildFeed──> CompilerManager ──updated──> ws broadcast
//!                                 │
//!                            CompilerHub ──reconcile/fetch-asset──┐
//!                                 ▲                               │
//!                          ServerCommands <── ws gateway / http gateway
//! ```
//!
//! The gateways never touch the hub directly; everything routes through
//! the composed [`ServerCommands`] table.

pub mod commands;
mod hub;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

pub use self::commands::{
    AssetRequest, ServerBinding, ServerCommandId, ServerCommands, ServerRegistry,
};
pub use self::hub::{AssetContent, ClientSession, CompilerHub};
use crate::config::ServerOptions;
use crate::ids::BuildHash;
use crate::logger::{ConsoleSink, LogRecord, Logger, LogSink, QueueSink};
use crate::manager::{BuildBackend, BuildEvent, BuildReport, CompilerManager};
use crate::protocol::UpdateRequest;
use crate::registry::command::executor;
use crate::registry::pubsub::Subscriber;
use crate::registry::{ModuleHandle, RegistryError};
use crate::transport::{HttpGateway, WsGateway};

const CHANNEL_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration `{name}` is registered twice")]
    DuplicateConfiguration { name: String },
    #[error("public path `{public_path}` for `{name}` must start with `/{name}/`")]
    PublicPathPrefix { name: String, public_path: String },
}

/// One build configuration the server manages.
pub struct CompilerConfiguration {
    pub name: String,
    /// Public URL prefix for this configuration's assets; defaults to
    /// `/<name>/`.
    pub public_path: Option<String>,
    pub output_dir: PathBuf,
    pub backend: Arc<dyn BuildBackend>,
}

impl CompilerConfiguration {
    pub fn new(
        name: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        backend: Arc<dyn BuildBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            public_path: None,
            output_dir: output_dir.into(),
            backend,
        }
    }

    pub fn with_public_path(mut self, public_path: impl Into<String>) -> Self {
        self.public_path = Some(public_path.into());
        self
    }
}

/// Handle the watch process uses to report build activity for one
/// configuration.
#[derive(Clone)]
pub struct BuildFeed {
    configuration: String,
    tx: mpsc::Sender<BuildEvent>,
}

impl BuildFeed {
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    /// The next build started; output is unstable until it completes.
    pub async fn invalidated(&self) {
        let _ = self.tx.send(BuildEvent::Invalidated).await;
    }

    /// One build finished.
    pub async fn completed(&self, report: BuildReport) {
        let _ = self.tx.send(BuildEvent::Completed(report)).await;
    }
}

fn normalize_public_path(name: &str, public_path: Option<String>) -> Result<String, ServerError> {
    let required = format!("/{name}/");
    match public_path {
        None => Ok(required),
        Some(path) if path.starts_with(&required) => Ok(path),
        Some(path) => Err(ServerError::PublicPathPrefix {
            name: name.to_string(),
            public_path: path,
        }),
    }
}

pub struct HotServer {
    log: Logger,
    options: ServerOptions,
    hub: Arc<CompilerHub>,
    commands: Arc<ServerCommands>,
    feeds: Vec<BuildFeed>,
    ws: Option<WsGateway>,
    http: Option<HttpGateway>,
}

impl HotServer {
    pub fn new(
        options: ServerOptions,
        configurations: Vec<CompilerConfiguration>,
    ) -> anyhow::Result<Self> {
        Self::with_sink(Arc::new(ConsoleSink), options, configurations)
    }

    /// Assemble the server with an explicit terminal log sink.
    ///
    /// All logging funnels through the composed `log` command; the sink
    /// only ever sees records the pump task has already routed.
    pub fn with_sink(
        sink: Arc<dyn LogSink>,
        options: ServerOptions,
        configurations: Vec<CompilerConfiguration>,
    ) -> anyhow::Result<Self> {
        let (queue, mut records) = QueueSink::channel();
        let log = Logger::new(Arc::new(queue))
            .with_min_level(options.log_level())
            .scoped("server");

        let mut managers = Vec::with_capacity(configurations.len());
        let mut feeds = Vec::with_capacity(configurations.len());
        let mut loops = Vec::with_capacity(configurations.len());
        for configuration in configurations {
            let public_path = normalize_public_path(&configuration.name, configuration.public_path)?;
            let manager = Arc::new(CompilerManager::new(
                &log,
                &configuration.name,
                public_path,
                configuration.output_dir,
                configuration.backend,
                options.history_limit,
            ));
            let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
            feeds.push(BuildFeed {
                configuration: configuration.name.clone(),
                tx,
            });
            loops.push((Arc::clone(&manager), rx));
            managers.push(manager);
        }

        let hub = Arc::new(CompilerHub::new(&log, managers)?);
        let commands = compose_commands(&log, &hub, sink)?;

        let pump_table = Arc::clone(&commands);
        tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                let _ = pump_table.log.execute(record).await;
            }
        });
        for (manager, rx) in loops {
            tokio::spawn(manager.run(rx));
        }

        Ok(Self {
            log,
            options,
            hub,
            commands,
            feeds,
            ws: None,
            http: None,
        })
    }

    /// Open the websocket gateway and hook every manager's update topic
    /// into its broadcaster.
    pub fn serve_ws(&mut self) -> anyhow::Result<u16> {
        let gateway = WsGateway::serve(
            &self.log,
            Arc::clone(&self.commands),
            &self.options.host,
            self.options.ws_port,
        )?;
        let broadcaster = gateway.broadcaster();
        for name in self.hub.configuration_names() {
            let Some(manager) = self.hub.manager(name) else {
                continue;
            };
            let configuration = name.to_string();
            let broadcaster = broadcaster.clone();
            let notify = Subscriber::new(move |_hash: BuildHash| {
                let broadcaster = broadcaster.clone();
                let configuration = configuration.clone();
                async move {
                    broadcaster.update_available(&configuration);
                    Ok(())
                }
            });
            manager.updated().subscribe(&notify)?;
        }
        let port = gateway.port();
        self.ws = Some(gateway);
        Ok(port)
    }

    pub fn serve_http(&mut self) -> anyhow::Result<u16> {
        let gateway = HttpGateway::serve(
            &self.log,
            Arc::clone(&self.commands),
            &self.options.host,
            self.options.http_port,
        )?;
        let port = gateway.port();
        self.http = Some(gateway);
        Ok(port)
    }

    pub fn build_feed(&self, configuration: &str) -> Option<BuildFeed> {
        self.feeds
            .iter()
            .find(|feed| feed.configuration == configuration)
            .cloned()
    }

    pub fn hub(&self) -> &Arc<CompilerHub> {
        &self.hub
    }

    pub fn commands(&self) -> &Arc<ServerCommands> {
        &self.commands
    }

    pub fn shutdown(&mut self) {
        if let Some(ws) = self.ws.take() {
            ws.shutdown();
        }
        if let Some(http) = self.http.take() {
            http.shutdown();
        }
    }
}

fn compose_commands(
    log: &Logger,
    hub: &Arc<CompilerHub>,
    sink: Arc<dyn LogSink>,
) -> Result<Arc<ServerCommands>, RegistryError> {
    let logger_module = ModuleHandle::new("logger");
    let hub_module = ModuleHandle::new("hub");
    let bindings = vec![
        ServerBinding::log(
            &logger_module,
            executor(move |record: LogRecord| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.submit(record);
                    Ok(())
                }
            }),
        ),
        ServerBinding::reconcile(&hub_module, {
            let hub = Arc::clone(hub);
            executor(move |request: UpdateRequest| {
                let hub = Arc::clone(&hub);
                async move { Ok(hub.reconcile(&request)) }
            })
        }),
        ServerBinding::fetch_asset(&hub_module, {
            let hub = Arc::clone(hub);
            executor(move |request: AssetRequest| {
                let hub = Arc::clone(&hub);
                async move { Ok(hub.fetch_asset(&request.path).await) }
            })
        }),
    ];
    ServerRegistry::compose(log, bindings)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::ids::ModuleId;
    use crate::logger::{Level, MemorySink};
    use crate::manager::BackendError;
    use crate::protocol::{ModuleDelta, UpdateResponse};

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

    fn configuration(name: &str) -> CompilerConfiguration {
        CompilerConfiguration::new(name, "/nonexistent-output", Arc::new(StubBackend))
    }

    #[test]
    fn test_public_path_defaults_to_the_configuration_name() {
        assert_eq!(normalize_public_path("web", None).unwrap(), "/web/");
        assert_eq!(
            normalize_public_path("web", Some("/web/assets/".into())).unwrap(),
            "/web/assets/"
        );
    }

    #[test]
    fn test_foreign_public_path_is_rejected() {
        let err = normalize_public_path("web", Some("/cdn/web/".into())).unwrap_err();
        assert!(matches!(err, ServerError::PublicPathPrefix { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_configurations_fail_assembly() {
        let sink = Arc::new(MemorySink::new());
        let result = HotServer::with_sink(
            sink,
            ServerOptions::default(),
            vec![configuration("web"), configuration("web")],
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_feed_drives_reconciliation_through_commands() {
        let sink = Arc::new(MemorySink::new());
        let server = HotServer::with_sink(
            Arc::clone(&sink) as Arc<dyn LogSink>,
            ServerOptions::default(),
            vec![configuration("web")],
        )
        .unwrap();

        let feed = server.build_feed("web").unwrap();
        assert!(server.build_feed("native").is_none());

        feed.invalidated().await;
        feed.completed(BuildReport::new("h1")).await;
        assert!(server.hub().await_hash("web", &BuildHash::new("h1")).await);

        let response = server
            .commands()
            .reconcile
            .execute(UpdateRequest::new("web", BuildHash::new("h1")))
            .await
            .unwrap();
        let UpdateResponse::Compatible {
            updates_to_apply, ..
        } = response
        else {
            panic!("expected compatible");
        };
        assert_eq!(updates_to_apply.len(), 1);
        assert_eq!(updates_to_apply[0].hash, BuildHash::new("h1"));

        // the pump forwarded manager logs to the terminal sink
        assert!(server.hub().wait_stable("web").await);
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        assert!(sink.contains(Level::Info, "Compiled successfully."));
    }
}
