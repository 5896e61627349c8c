//! Build update records.
//!
//! One [`Update`] per completed build: diagnostics, produced assets and
//! the per-module replacement sources relative to the previous tracked
//! build. Updates are append-only and immutable once recorded; the same
//! build hash always denotes the same record.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{BuildHash, ChunkId, ModuleId};

/// Line/column position inside a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// Region of a source file a diagnostic points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start: SourcePosition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<SourcePosition>,
}

/// One compiler error or warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceSpan>,
}

impl Diagnostic {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
            location: None,
        }
    }

    pub fn in_file(message: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: Some(file.into()),
            location: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, &self.location) {
            (Some(file), Some(span)) => {
                write!(f, "{} ({file}:{})", self.message, span.start.line)
            }
            (Some(file), None) => write!(f, "{} ({file})", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Chunk and module bookkeeping the build tool emits for one incremental
/// update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_chunk_ids: Vec<ChunkId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_chunk_ids: Vec<ChunkId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_module_ids: Vec<ModuleId>,
}

impl UpdateManifest {
    pub fn is_empty(&self) -> bool {
        self.updated_chunk_ids.is_empty()
            && self.removed_chunk_ids.is_empty()
            && self.removed_module_ids.is_empty()
    }
}

/// Incremental payload for one `prior -> next` build transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleDelta {
    pub manifest: UpdateManifest,
    /// Full replacement source per module whose output changed.
    pub sources: BTreeMap<ModuleId, String>,
}

/// Record of one completed build.
///
/// `updated_module_sources` is the delta against the previous tracked
/// build; the very first build documents starting state only and carries
/// an empty delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub hash: BuildHash,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Diagnostic>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Diagnostic>,
    /// Output file names produced by this build.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,
    #[serde(default, skip_serializing_if = "UpdateManifest::is_empty")]
    pub manifest: UpdateManifest,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updated_module_sources: BTreeMap<ModuleId, String>,
}

impl Update {
    /// First-build record: nothing to diff against.
    pub fn baseline(hash: BuildHash) -> Self {
        Self {
            hash,
            errors: Vec::new(),
            warnings: Vec::new(),
            assets: Vec::new(),
            manifest: UpdateManifest::default(),
            updated_module_sources: BTreeMap::new(),
        }
    }

    pub fn with_delta(hash: BuildHash, delta: ModuleDelta) -> Self {
        Self {
            hash,
            errors: Vec::new(),
            warnings: Vec::new(),
            assets: Vec::new(),
            manifest: delta.manifest,
            updated_module_sources: delta.sources,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Short form for logs: hash plus counts, never the sources.
    pub fn summary(&self) -> String {
        format!(
            "{} ({} modules, {} errors, {} warnings)",
            self.hash,
            self.updated_module_sources.len(),
            self.errors.len(),
            self.warnings.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_carries_no_delta() {
        let update = Update::baseline(BuildHash::new("first"));
        assert!(update.updated_module_sources.is_empty());
        assert!(update.manifest.is_empty());
        assert!(!update.has_errors());
    }

    #[test]
    fn test_lean_serialization_skips_empty_fields() {
        let update = Update::baseline(BuildHash::new("first"));
        let json = serde_json::to_string(&update).unwrap();
        assert_eq!(json, r#"{"hash":"first"}"#);
    }

    #[test]
    fn test_update_round_trip() {
        let mut delta = ModuleDelta::default();
        delta
            .sources
            .insert(ModuleId::new("mod1"), "export default 2;".to_string());
        delta.manifest.removed_module_ids.push(ModuleId::new("mod9"));
        let update = Update::with_delta(BuildHash::new("b"), delta);

        let json = serde_json::to_string(&update).unwrap();
        let back: Update = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
        assert_eq!(
            back.updated_module_sources.get(&ModuleId::new("mod1")).map(String::as_str),
            Some("export default 2;")
        );
    }

    #[test]
    fn test_diagnostic_display() {
        let plain = Diagnostic::message("unexpected token");
        assert_eq!(plain.to_string(), "unexpected token");
        let located = Diagnostic {
            message: "unexpected token".to_string(),
            file: Some("src/app.js".to_string()),
            location: Some(SourceSpan {
                start: SourcePosition {
                    line: 5,
                    column: Some(2),
                },
                end: None,
            }),
        };
        assert_eq!(located.to_string(), "unexpected token (src/app.js:5)");
    }

    #[test]
    fn test_summary_omits_sources() {
        let mut delta = ModuleDelta::default();
        delta
            .sources
            .insert(ModuleId::new("mod1"), "very long module body".to_string());
        let update = Update::with_delta(BuildHash::new("b"), delta);
        let summary = update.summary();
        assert!(summary.contains("b (1 modules"));
        assert!(!summary.contains("very long module body"));
    }
}
