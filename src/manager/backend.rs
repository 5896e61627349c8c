//! Build tool boundary.
//!
//! The build tool is an external collaborator: it watches sources,
//! compiles continuously and emits one report per finished build plus an
//! incremental artifact per transition. The manager consumes both through
//! the types here and never drives compilation itself.

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::{BuildHash, ModuleId};
use crate::protocol::{Diagnostic, ModuleDelta};

/// One module as enumerated in a build's module graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleArtifact {
    pub id: ModuleId,
    /// Emitted source text.
    pub source: String,
    /// The build tool's own change hash for this module.
    pub change_hash: String,
}

impl ModuleArtifact {
    pub fn new(
        id: impl Into<ModuleId>,
        source: impl Into<String>,
        change_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            change_hash: change_hash.into(),
        }
    }
}

/// Everything the build tool reports for one completed build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub hash: BuildHash,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    /// Output file names this build produced.
    pub assets: Vec<String>,
    /// Full module graph snapshot.
    pub modules: Vec<ModuleArtifact>,
}

impl BuildReport {
    pub fn new(hash: impl Into<BuildHash>) -> Self {
        Self {
            hash: hash.into(),
            errors: Vec::new(),
            warnings: Vec::new(),
            assets: Vec::new(),
            modules: Vec::new(),
        }
    }

    pub fn with_module(
        mut self,
        id: impl Into<ModuleId>,
        source: impl Into<String>,
        change_hash: impl Into<String>,
    ) -> Self {
        self.modules.push(ModuleArtifact::new(id, source, change_hash));
        self
    }

    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.assets.push(asset.into());
        self
    }

    pub fn with_error(mut self, error: Diagnostic) -> Self {
        self.errors.push(error);
        self
    }

    pub fn with_warning(mut self, warning: Diagnostic) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// Signals from the watch process driving a compiler manager.
#[derive(Debug)]
pub enum BuildEvent {
    /// Source changed, a rebuild is underway; output is unstable until
    /// the next completed build.
    Invalidated,
    /// A build finished, possibly with diagnostics.
    Completed(BuildReport),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no incremental artifact for transition {prior} -> {next}")]
    MissingArtifact { prior: BuildHash, next: BuildHash },
    #[error("incremental artifact for {hash} is unreadable: {detail}")]
    Unreadable { hash: BuildHash, detail: String },
}

/// Query capability the build tool must provide over its incremental
/// output.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Replacement sources and manifest for the update the build tool
    /// produced while moving `prior` to `next`.
    async fn incremental_delta(
        &self,
        prior: &BuildHash,
        next: &BuildHash,
    ) -> Result<ModuleDelta, BackendError>;
}
