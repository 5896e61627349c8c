//! Module host boundary.
//!
//! The running process exposes one primitive: apply a build update's
//! replacement sources in place. How modules are evaluated is the host's
//! business; the runtime only sequences applies and reads the resulting
//! state.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use thiserror::Error;

use crate::ids::{BuildHash, ModuleId};
use crate::protocol::Update;

/// Hot-apply machinery state as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// Ready to accept an update.
    Idle,
    /// An apply is in progress.
    Applying,
    /// The last apply left the module system unusable; only a full
    /// restart recovers.
    Abort,
    /// The last apply was rejected but the module system is still usable.
    Fail,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            HostStatus::Idle => "idle",
            HostStatus::Applying => "applying",
            HostStatus::Abort => "abort",
            HostStatus::Fail => "fail",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("evaluation of module `{module}` failed: {detail}")]
    Evaluation { module: ModuleId, detail: String },
    #[error("update {hash} rejected: {detail}")]
    Rejected { hash: BuildHash, detail: String },
}

/// Module-replacement primitive of the running process.
///
/// `apply` may only be called while `status` reports idle. After a
/// successful apply the live hash equals the applied update's hash; after
/// a failed one, `status` reports whether the module system survived
/// (`Fail`) or not (`Abort`).
#[async_trait]
pub trait ModuleHost: Send + Sync {
    /// Hash of the build the process currently runs.
    fn current_hash(&self) -> BuildHash;

    /// Hot-apply machinery state.
    fn status(&self) -> HostStatus;

    /// Install the update's replacement sources, returning the ids of
    /// every module that was touched.
    async fn apply(&self, update: &Update) -> Result<Vec<ModuleId>, HostError>;
}

/// Reference [`ModuleHost`] holding module sources in memory.
///
/// Backs embedded script hosts and doubles as the harness for exercising
/// the swap machinery; `poison` injects a failure for one specific update
/// hash.
pub struct MemoryHost {
    state: Mutex<MemoryHostState>,
}

struct MemoryHostState {
    hash: BuildHash,
    status: HostStatus,
    modules: FxHashMap<ModuleId, String>,
    poisoned: Option<(BuildHash, HostStatus)>,
}

impl MemoryHost {
    pub fn new(initial_hash: impl Into<BuildHash>) -> Self {
        Self {
            state: Mutex::new(MemoryHostState {
                hash: initial_hash.into(),
                status: HostStatus::Idle,
                modules: FxHashMap::default(),
                poisoned: None,
            }),
        }
    }

    /// Pre-seed a module's source.
    pub fn install(&self, id: impl Into<ModuleId>, source: impl Into<String>) {
        self.state.lock().modules.insert(id.into(), source.into());
    }

    /// Make the apply of `hash` fail, leaving the host in `status`.
    pub fn poison(&self, hash: impl Into<BuildHash>, status: HostStatus) {
        self.state.lock().poisoned = Some((hash.into(), status));
    }

    /// Overwrite the live hash without going through an apply.
    pub fn set_current_hash(&self, hash: impl Into<BuildHash>) {
        self.state.lock().hash = hash.into();
    }

    /// Source currently installed for `id`.
    pub fn module_source(&self, id: &ModuleId) -> Option<String> {
        self.state.lock().modules.get(id).cloned()
    }

    pub fn module_count(&self) -> usize {
        self.state.lock().modules.len()
    }
}

#[async_trait]
impl ModuleHost for MemoryHost {
    fn current_hash(&self) -> BuildHash {
        self.state.lock().hash.clone()
    }

    fn status(&self) -> HostStatus {
        self.state.lock().status
    }

    async fn apply(&self, update: &Update) -> Result<Vec<ModuleId>, HostError> {
        let mut state = self.state.lock();
        if state.status != HostStatus::Idle {
            return Err(HostError::Rejected {
                hash: update.hash.clone(),
                detail: format!("host status is {}", state.status),
            });
        }
        if let Some((poisoned, outcome)) = state.poisoned.clone() {
            if poisoned == update.hash {
                state.status = outcome;
                return Err(HostError::Rejected {
                    hash: update.hash.clone(),
                    detail: "injected failure".to_string(),
                });
            }
        }
        state.status = HostStatus::Applying;
        let mut touched = Vec::new();
        for (id, source) in &update.updated_module_sources {
            state.modules.insert(id.clone(), source.clone());
            touched.push(id.clone());
        }
        for id in &update.manifest.removed_module_ids {
            if state.modules.remove(id).is_some() {
                touched.push(id.clone());
            }
        }
        state.hash = update.hash.clone();
        state.status = HostStatus::Idle;
        Ok(touched)
    }
}
