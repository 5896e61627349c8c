//! Rekindle - hot module replacement plumbing between a build tool and
//! running application processes.
//!
//! The server side tracks one [`CompilerManager`] per build
//! configuration and turns completed builds into an append-only history
//! of module-source deltas. Clients reconcile their live build hash
//! against that history over a [`ServerLink`] and hot-swap the missing
//! updates into their [`ModuleHost`], escalating to an application
//! restart when no delta path exists.

pub mod client;
pub mod config;
pub mod ids;
pub mod logger;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod restart;
pub mod runtime;
pub mod server;
pub mod transport;

pub use client::HotClient;
pub use config::{ClientOptions, Options, ServerOptions};
pub use ids::{BuildHash, ChunkId, ClientId, ModuleId};
pub use logger::{Level, Logger};
pub use manager::{BuildBackend, BuildEvent, BuildReport, CompilerManager};
pub use protocol::{Update, UpdateRequest, UpdateResponse, WireMessage};
pub use restart::RestartAction;
pub use runtime::{HotSwapRuntime, MemoryHost, ModuleHost};
pub use server::{BuildFeed, CompilerConfiguration, CompilerHub, HotServer};
pub use transport::{LocalLink, ServerLink, ServerNotice, WsServerLink};
