//! Per-module change tracking across builds.
//!
//! One monitor per module id, kept for the life of the process. Each
//! completed build folds its module graph into the ledger; the fingerprint
//! comparison is what catches build tools reporting changes that did not
//! actually happen.

use rustc_hash::FxHashMap;

use super::backend::ModuleArtifact;
use super::fingerprint::ContentHash;
use crate::ids::ModuleId;

/// Last observed state of one module id.
#[derive(Debug, Clone)]
pub struct ModuleMonitor {
    /// The build tool's change hash at last observation.
    pub change_hash: String,
    /// Last observed emitted source.
    pub source: String,
    /// Independent fingerprint of `source`.
    pub fingerprint: ContentHash,
}

/// What observing one build's artifact revealed about a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First time this module id appears.
    FirstSeen,
    /// The change hash moved and the content really changed.
    Changed,
    /// The change hash moved but the content is byte-identical; the
    /// reported change is a false positive.
    FalsePositive,
    /// Change hash unchanged.
    Unchanged,
}

/// The monitor table for one compiler manager.
#[derive(Debug, Default)]
pub struct ModuleLedger {
    monitors: FxHashMap<ModuleId, ModuleMonitor>,
}

impl ModuleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    pub fn get(&self, id: &ModuleId) -> Option<&ModuleMonitor> {
        self.monitors.get(id)
    }

    /// Fold one reported artifact into the ledger.
    pub fn observe(&mut self, artifact: &ModuleArtifact) -> Observation {
        let fingerprint = ContentHash::of(&artifact.source);
        match self.monitors.get_mut(&artifact.id) {
            None => {
                self.monitors.insert(
                    artifact.id.clone(),
                    ModuleMonitor {
                        change_hash: artifact.change_hash.clone(),
                        source: artifact.source.clone(),
                        fingerprint,
                    },
                );
                Observation::FirstSeen
            }
            Some(monitor) if monitor.change_hash != artifact.change_hash => {
                let false_positive = monitor.fingerprint == fingerprint;
                monitor.change_hash = artifact.change_hash.clone();
                monitor.source = artifact.source.clone();
                monitor.fingerprint = fingerprint;
                if false_positive {
                    Observation::FalsePositive
                } else {
                    Observation::Changed
                }
            }
            Some(_) => Observation::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(id: &str, source: &str, change_hash: &str) -> ModuleArtifact {
        ModuleArtifact::new(id, source, change_hash)
    }

    #[test]
    fn test_first_observation() {
        let mut ledger = ModuleLedger::new();
        assert_eq!(
            ledger.observe(&artifact("mod1", "export default 1;", "aaa")),
            Observation::FirstSeen
        );
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_real_change() {
        let mut ledger = ModuleLedger::new();
        ledger.observe(&artifact("mod1", "export default 1;", "aaa"));
        assert_eq!(
            ledger.observe(&artifact("mod1", "export default 2;", "bbb")),
            Observation::Changed
        );
        let monitor = ledger.get(&ModuleId::new("mod1")).unwrap();
        assert_eq!(monitor.source, "export default 2;");
        assert_eq!(monitor.change_hash, "bbb");
    }

    #[test]
    fn test_false_positive_when_hash_moves_without_content() {
        let mut ledger = ModuleLedger::new();
        ledger.observe(&artifact("mod1", "export default 1;", "aaa"));
        assert_eq!(
            ledger.observe(&artifact("mod1", "export default 1;", "bbb")),
            Observation::FalsePositive
        );
        // the moved hash is still recorded so the next build diffs
        // against the right baseline
        let monitor = ledger.get(&ModuleId::new("mod1")).unwrap();
        assert_eq!(monitor.change_hash, "bbb");
    }

    #[test]
    fn test_unchanged_hash() {
        let mut ledger = ModuleLedger::new();
        ledger.observe(&artifact("mod1", "export default 1;", "aaa"));
        assert_eq!(
            ledger.observe(&artifact("mod1", "export default 1;", "aaa")),
            Observation::Unchanged
        );
        assert_eq!(ledger.len(), 1);
    }
}
