//! Transport gateways and links.
//!
//! The server opens two gateways: a websocket endpoint carrying the
//! update protocol and a plain HTTP endpoint serving built assets. A
//! client reaches the server through a [`ServerLink`]; [`WsServerLink`]
//! crosses the network while [`LocalLink`] short-circuits into a
//! compiler hub living in the same process.

pub mod http;
pub mod link;
pub mod local;
pub mod ws;

pub use self::http::HttpGateway;
pub use self::link::{LinkError, ServerLink, ServerNotice, WsServerLink};
pub use self::local::LocalLink;
pub use self::ws::{Broadcaster, WsGateway};
