//! Client/server update protocol: build records and wire messages.

pub mod message;
pub mod update;

pub use message::{UpdateRequest, UpdateResponse, WireMessage};
pub use update::{Diagnostic, ModuleDelta, SourcePosition, SourceSpan, Update, UpdateManifest};
