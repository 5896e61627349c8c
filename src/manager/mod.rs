//! Compiler manager: tracks one continuous build per configuration.
//!
//! While a rebuild is in flight the output is unstable and readers queue;
//! each completed build appends one update record carrying the per-module
//! source delta since the previous tracked build. History is append-only,
//! bounded by a retention limit, and every append fans out through the
//! `updated` topic.
//!
//! ```text
//! BuildEvent::Invalidated ──> stable=false, readers wait
//! BuildEvent::Completed ────> fingerprint check -> delta -> append
//!                              -> updated topic -> stable=true
//! ```

mod backend;
mod fingerprint;
mod monitor;


pub use backend::{BackendError, BuildBackend, BuildEvent, BuildReport, ModuleArtifact};
pub use fingerprint::ContentHash;
pub use monitor::{ModuleLedger, ModuleMonitor, Observation};

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::ids::{BuildHash, ModuleId};
use crate::logger::Logger;
use crate::protocol::{ModuleDelta, Update};
use crate::registry::pubsub::PubSub;

/// Tracks build stability, update history and module monitors for one
/// build configuration.
pub struct CompilerManager {
    log: Logger,
    configuration: String,
    /// Public URL prefix, always of the form `/<name>/...` and ending
    /// with a slash.
    public_path: String,
    output_dir: PathBuf,
    backend: Arc<dyn BuildBackend>,
    history_limit: usize,
    ledger: Mutex<ModuleLedger>,
    updates: RwLock<Vec<Update>>,
    stable_tx: watch::Sender<bool>,
    latest_tx: watch::Sender<Option<BuildHash>>,
    updated: PubSub<BuildHash>,
}

impl CompilerManager {
    pub fn new(
        log: &Logger,
        configuration: impl Into<String>,
        public_path: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        backend: Arc<dyn BuildBackend>,
        history_limit: usize,
    ) -> Self {
        let configuration = configuration.into();
        Self {
            log: log.scoped(&configuration),
            configuration,
            public_path: public_path.into(),
            output_dir: output_dir.into(),
            backend,
            history_limit: history_limit.max(1),
            ledger: Mutex::new(ModuleLedger::new()),
            updates: RwLock::new(Vec::new()),
            stable_tx: watch::channel(false).0,
            latest_tx: watch::channel(None).0,
            updated: PubSub::new("updated"),
        }
    }

    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    pub fn public_path(&self) -> &str {
        &self.public_path
    }

    /// Notified with the new build hash after each appended update.
    pub fn updated(&self) -> &PubSub<BuildHash> {
        &self.updated
    }

    /// Event loop; feed it from the watch process driving this
    /// configuration. Ends when the feed closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<BuildEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                BuildEvent::Invalidated => self.on_invalidated(),
                BuildEvent::Completed(report) => self.on_build_completed(report).await,
            }
        }
        self.log.debug("build event feed closed");
    }

    // ====== Build Events ======

    /// Source changed; output is unstable until the next completed build.
    pub fn on_invalidated(&self) {
        if !*self.stable_tx.borrow() {
            self.log
                .error("invalidate signal while output was already unstable");
        }
        self.stable_tx.send_replace(false);
        self.log.info("Recompiling...");
    }

    /// Fold one completed build into history and mark output stable.
    pub async fn on_build_completed(&self, report: BuildReport) {
        // Cross-check every reported module against its monitor before
        // trusting the build tool's change hashes.
        let false_positives = self.observe_modules(&report);

        let prior = self.updates.read().last().map(|u| u.hash.clone());
        match prior {
            Some(prior) if prior == report.hash => {
                self.log.debug(format!(
                    "rebuild reproduced hash {prior}; nothing new to record"
                ));
            }
            prior => match self.delta_for(prior.as_ref(), &report).await {
                Ok(mut delta) => {
                    self.strip_false_positives(&mut delta, &false_positives);
                    self.append_update(&report, delta).await;
                }
                Err(err) => {
                    // Without the artifact there is no honest delta for
                    // this transition. Restart history at a fresh baseline
                    // so stale clients reconcile as incompatible instead
                    // of applying a wrong diff.
                    self.log
                        .error(format!("incremental artifact lookup failed: {err}"));
                    self.reset_to_baseline(&report).await;
                }
            },
        }

        self.log_compilation_result(&report);
        self.stable_tx.send_replace(true);
    }

    fn observe_modules(&self, report: &BuildReport) -> Vec<ModuleId> {
        let mut ledger = self.ledger.lock();
        let mut false_positives = Vec::new();
        for artifact in &report.modules {
            if ledger.observe(artifact) == Observation::FalsePositive {
                self.log.warn(format!(
                    "build tool reported a change in module `{}` but its content is identical; ignoring",
                    artifact.id
                ));
                false_positives.push(artifact.id.clone());
            }
        }
        false_positives
    }

    async fn delta_for(
        &self,
        prior: Option<&BuildHash>,
        report: &BuildReport,
    ) -> Result<ModuleDelta, BackendError> {
        match prior {
            // First build: nothing to diff against.
            None => Ok(ModuleDelta::default()),
            Some(prior) => self.backend.incremental_delta(prior, &report.hash).await,
        }
    }

    fn strip_false_positives(&self, delta: &mut ModuleDelta, false_positives: &[ModuleId]) {
        for id in false_positives {
            if delta.sources.remove(id).is_some() {
                self.log
                    .warn(format!("dropping module `{id}` from the update"));
            }
        }
    }

    async fn append_update(&self, report: &BuildReport, delta: ModuleDelta) {
        let update = Update {
            hash: report.hash.clone(),
            errors: report.errors.clone(),
            warnings: report.warnings.clone(),
            assets: report.assets.clone(),
            manifest: delta.manifest,
            updated_module_sources: delta.sources,
        };
        self.log.debug(format!("recorded update {}", update.summary()));
        self.push_update(update).await;
    }

    async fn reset_to_baseline(&self, report: &BuildReport) {
        let dropped = {
            let mut updates = self.updates.write();
            let dropped = updates.len();
            updates.clear();
            dropped
        };
        if dropped > 0 {
            self.log.warn(format!(
                "dropped {dropped} retained updates; clients on older hashes must restart"
            ));
        }
        let mut baseline = Update::baseline(report.hash.clone());
        baseline.errors = report.errors.clone();
        baseline.warnings = report.warnings.clone();
        baseline.assets = report.assets.clone();
        self.push_update(baseline).await;
    }

    async fn push_update(&self, update: Update) {
        let hash = update.hash.clone();
        {
            let mut updates = self.updates.write();
            updates.push(update);
            let excess = updates.len().saturating_sub(self.history_limit);
            if excess > 0 {
                updates.drain(..excess);
                self.log.debug(format!(
                    "pruned {excess} oldest updates (retention limit {})",
                    self.history_limit
                ));
            }
        }
        self.latest_tx.send_replace(Some(hash.clone()));
        for failure in self.updated.publish(hash).await {
            self.log
                .error(format!("updated subscriber failed: {failure:#}"));
        }
    }

    fn log_compilation_result(&self, report: &BuildReport) {
        if !report.errors.is_empty() {
            self.log.error("Failed to compile.");
            for diagnostic in &report.errors {
                self.log.error(diagnostic.to_string());
            }
        } else if !report.warnings.is_empty() {
            self.log.warn("Compiled with warnings.");
            for diagnostic in &report.warnings {
                self.log.warn(diagnostic.to_string());
            }
        } else {
            self.log.info("Compiled successfully.");
        }
    }

    // ====== Read Side ======

    /// True once build output is stable and readable.
    pub fn is_stable(&self) -> bool {
        *self.stable_tx.borrow()
    }

    /// Wait until build output reaches a stable snapshot.
    pub async fn wait_stable(&self) {
        let mut rx = self.stable_tx.subscribe();
        let _ = rx.wait_for(|stable| *stable).await;
    }

    /// Wait until `hash` is the latest recorded build.
    pub async fn await_hash(&self, hash: &BuildHash) {
        let mut rx = self.latest_tx.subscribe();
        let _ = rx.wait_for(|latest| latest.as_ref() == Some(hash)).await;
    }

    /// Snapshot of the retained update history, oldest first.
    pub fn updates_snapshot(&self) -> Vec<Update> {
        self.updates.read().clone()
    }

    pub fn update_count(&self) -> usize {
        self.updates.read().len()
    }

    /// Open one produced output file by its public request path.
    ///
    /// Waits for a stable build first, so a request racing a rebuild sees
    /// finished output. Every failure is soft: logged, `None` returned.
    pub async fn open_output(&self, request_path: &str) -> Option<File> {
        self.wait_stable().await;
        let local = self.resolve_output_path(request_path)?;
        match File::open(&local) {
            Ok(file) => Some(file),
            Err(err) => {
                self.log
                    .error(format!("failed to open output `{}`: {err}", local.display()));
                None
            }
        }
    }

    /// Map a public request path onto the output directory.
    fn resolve_output_path(&self, request_path: &str) -> Option<PathBuf> {
        let request_path = request_path.split('?').next().unwrap_or(request_path);
        let Some(relative) = request_path.strip_prefix(self.public_path.as_str()) else {
            self.log.error(format!(
                "request path `{request_path}` does not fall under public path `{}`",
                self.public_path
            ));
            return None;
        };
        if relative.split('/').any(|segment| segment == "..") {
            self.log
                .error(format!("rejecting traversal in request path `{request_path}`"));
            return None;
        }
        let local = self.output_dir.join(relative);
        if !local.is_file() {
            self.log.debug(format!("no output file at `{}`", local.display()));
            return None;
        }
        Some(local)
    }
}
