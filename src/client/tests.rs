use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::HotClient;
use crate::config::ClientOptions;
use crate::ids::{BuildHash, ModuleId};
use crate::logger::{Level, Logger, MemorySink};
use crate::manager::{BackendError, BuildBackend, BuildReport, CompilerManager};
use crate::protocol::ModuleDelta;
use crate::restart::RestartAction;
use crate::runtime::{MemoryHost, ModuleHost};
use crate::server::CompilerHub;
use crate::transport::LocalLink;

fn source(hash: &str) -> String {
    format!("export const build = \"{hash}\";")
}

/// Reports every build as a one-module delta touching `app`.
struct StubBackend;

#[async_trait]
impl BuildBackend for StubBackend {
    async fn incremental_delta(
        &self,
        _prior: &BuildHash,
        next: &BuildHash,
    ) -> Result<ModuleDelta, BackendError> {
        let mut delta = ModuleDelta::default();
        delta.sources.insert(ModuleId::new("app"), source(next.as_str()));
        Ok(delta)
    }
}

#[derive(Default)]
struct CountingRestart {
    calls: AtomicUsize,
}

#[async_trait]
impl RestartAction for CountingRestart {
    async fn restart(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One `web` configuration with the given builds already recorded.
async fn hub_with_builds(sink: &Arc<MemorySink>, hashes: &[&str]) -> Arc<CompilerHub> {
    let log = Logger::new(sink.clone());
    let manager = Arc::new(CompilerManager::new(
        &log,
        "web",
        "/web/",
        PathBuf::from("/nonexistent"),
        Arc::new(StubBackend),
        8,
    ));
    for (i, hash) in hashes.iter().enumerate() {
        if i > 0 {
            manager.on_invalidated();
        }
        manager
            .on_build_completed(BuildReport::new(*hash).with_module("app", source(hash), *hash))
            .await;
    }
    Arc::new(CompilerHub::new(&log, vec![manager]).unwrap())
}

fn connect_client(
    sink: &Arc<MemorySink>,
    options: &ClientOptions,
    hub: &Arc<CompilerHub>,
    host: &Arc<MemoryHost>,
) -> (HotClient, Arc<CountingRestart>) {
    let link = LocalLink::new(Arc::clone(hub));
    let notices = LocalLink::notices(hub).unwrap();
    let restart = Arc::new(CountingRestart::default());
    let client = HotClient::with_sink(
        sink.clone(),
        options,
        "web",
        link,
        notices,
        Arc::clone(host) as _,
        Arc::clone(&restart) as _,
    )
    .unwrap();
    (client, restart)
}

/// Let the spawned client tasks drain their queues.
async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_client_applies_builds_announced_by_the_server() {
    let sink = Arc::new(MemorySink::new());
    let hub = hub_with_builds(&sink, &["h1"]).await;
    let host = Arc::new(MemoryHost::new("h1"));
    let options = ClientOptions::default();
    let (client, restart) = connect_client(&sink, &options, &hub, &host);
    settle().await;

    // two builds land while the client stays connected
    for hash in ["h2", "h3"] {
        let manager = hub.manager("web").unwrap();
        manager.on_invalidated();
        manager
            .on_build_completed(BuildReport::new(hash).with_module("app", source(hash), hash))
            .await;
        settle().await;
    }

    assert_eq!(host.current_hash(), BuildHash::new("h3"));
    assert_eq!(
        host.module_source(&ModuleId::new("app")),
        Some(source("h3"))
    );
    assert_eq!(restart.calls.load(Ordering::SeqCst), 0);
    // the id minted on the first request was echoed ever after
    assert_eq!(hub.session_count(), 1);
    assert!(sink.contains(Level::Info, "hot updated: app"));
    assert!(sink.contains(Level::Info, "Compiled successfully."));
    client.shutdown().await;
}

#[tokio::test]
async fn test_stale_client_escalates_to_restart() {
    let sink = Arc::new(MemorySink::new());
    // the server lost the history this client was built from
    let hub = hub_with_builds(&sink, &["h5"]).await;
    let host = Arc::new(MemoryHost::new("h1"));
    let options = ClientOptions::default();
    let (client, restart) = connect_client(&sink, &options, &hub, &host);
    settle().await;

    assert_eq!(restart.calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.current_hash(), BuildHash::new("h1"));
    assert_eq!(host.module_count(), 0);
    assert!(sink.contains(Level::Error, "retained history"));
    client.shutdown().await;
}

#[tokio::test]
async fn test_disabled_hot_swap_restarts_the_application() {
    let sink = Arc::new(MemorySink::new());
    let hub = hub_with_builds(&sink, &["h1", "h2"]).await;
    let host = Arc::new(MemoryHost::new("h1"));
    let options = ClientOptions {
        hot_swap: false,
        ..ClientOptions::default()
    };
    let (client, restart) = connect_client(&sink, &options, &hub, &host);
    settle().await;

    assert_eq!(restart.calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.current_hash(), BuildHash::new("h1"));
    assert_eq!(host.module_count(), 0);
    assert!(sink.contains(Level::Info, "hot swapping is disabled"));
    client.shutdown().await;
}

#[tokio::test]
async fn test_aborted_apply_escalates_to_restart() {
    let sink = Arc::new(MemorySink::new());
    let hub = hub_with_builds(&sink, &["h1", "h2"]).await;
    let host = Arc::new(MemoryHost::new("h1"));
    host.poison("h2", crate::runtime::HostStatus::Abort);
    let options = ClientOptions::default();
    let (client, restart) = connect_client(&sink, &options, &hub, &host);
    settle().await;

    assert_eq!(restart.calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.current_hash(), BuildHash::new("h1"));
    assert!(sink.contains(Level::Error, "module host aborted"));
    assert!(sink.contains(Level::Fatal, "hot swap runtime error"));
    client.shutdown().await;
}
