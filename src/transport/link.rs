//! Client-side links to the update server.
//!
//! [`WsServerLink`] runs one io thread that owns the socket. Requests are
//! queued through a channel and matched to their response by a single
//! pending slot, which is all the protocol needs: the runtime never has
//! more than one request outstanding.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tungstenite::WebSocket;
use tungstenite::protocol::Message;
use tungstenite::stream::MaybeTlsStream;

use crate::logger::Logger;
use crate::protocol::{UpdateRequest, UpdateResponse, WireMessage};

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Poll interval for non-blocking socket reads.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection lost before a response arrived")]
    ConnectionLost,
    #[error("a request is already waiting for its response")]
    RequestInFlight,
    #[error("failed to connect: {0}")]
    Connect(String),
}

/// Transport the client uses to reach the update server.
#[async_trait]
pub trait ServerLink: Send + Sync {
    async fn send_update_request(
        &self,
        request: UpdateRequest,
    ) -> Result<UpdateResponse, LinkError>;

    /// Resolves once the link can carry a request.
    async fn ready(&self);
}

/// Out-of-band events a link surfaces to the client assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNotice {
    /// The link (re)connected; a sync is worthwhile.
    Connected,
    /// The server appended an update for this configuration.
    UpdateAvailable { configuration: String },
}

type PendingSlot = Arc<Mutex<Option<oneshot::Sender<UpdateResponse>>>>;

pub struct WsServerLink {
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingSlot,
    ready_rx: watch::Receiver<bool>,
}

impl WsServerLink {
    /// Spawn the io thread and return the link plus its notice stream.
    ///
    /// The thread keeps reconnecting until the link and its notice
    /// receiver are both dropped.
    pub fn connect(
        log: &Logger,
        url: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerNotice>) {
        let log = log.scoped("ws-link");
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let pending: PendingSlot = Arc::new(Mutex::new(None));

        let io = IoLoop {
            log,
            url: url.into(),
            outbound: outbound_rx,
            notices: notice_tx,
            ready: ready_tx,
            pending: Arc::clone(&pending),
        };
        thread::spawn(move || io.run());

        (
            Arc::new(Self {
                outbound: outbound_tx,
                pending,
                ready_rx,
            }),
            notice_rx,
        )
    }
}

#[async_trait]
impl ServerLink for WsServerLink {
    async fn send_update_request(
        &self,
        request: UpdateRequest,
    ) -> Result<UpdateResponse, LinkError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return Err(LinkError::RequestInFlight);
            }
            *pending = Some(tx);
        }
        let frame = WireMessage::request(request).to_json();
        if self.outbound.send(frame).is_err() {
            self.pending.lock().take();
            return Err(LinkError::ConnectionLost);
        }
        // the io thread drops the sender when the connection dies
        rx.await.map_err(|_| LinkError::ConnectionLost)
    }

    async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

enum SessionEnd {
    /// The connection dropped; reconnect.
    Lost,
    /// The link handle was dropped; wind down for good.
    Finished,
}

struct IoLoop {
    log: Logger,
    url: String,
    outbound: mpsc::UnboundedReceiver<String>,
    notices: mpsc::UnboundedSender<ServerNotice>,
    ready: watch::Sender<bool>,
    pending: PendingSlot,
}

impl IoLoop {
    fn run(mut self) {
        loop {
            let socket = match self.connect_once() {
                Ok(socket) => socket,
                Err(err) => {
                    self.log
                        .warn(format!("{err}; retrying in {RECONNECT_DELAY:?}"));
                    thread::sleep(RECONNECT_DELAY);
                    continue;
                }
            };
            self.log.debug(format!("connected to {}", self.url));
            self.ready.send_replace(true);
            let end = self.session(socket);
            self.ready.send_replace(false);
            self.fail_pending();
            match end {
                SessionEnd::Finished => return,
                SessionEnd::Lost => self.log.warn("connection lost; reconnecting"),
            }
        }
    }

    fn connect_once(&self) -> Result<WebSocket<MaybeTlsStream<TcpStream>>, LinkError> {
        let (socket, _response) = tungstenite::connect(self.url.as_str())
            .map_err(|err| LinkError::Connect(err.to_string()))?;
        // Handshake in blocking mode, poll reads afterwards.
        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            stream
                .set_nonblocking(true)
                .map_err(|err| LinkError::Connect(err.to_string()))?;
        }
        Ok(socket)
    }

    fn session(&mut self, mut socket: WebSocket<MaybeTlsStream<TcpStream>>) -> SessionEnd {
        loop {
            // flush queued frames before polling for input
            loop {
                match self.outbound.try_recv() {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame.into())).is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return SessionEnd::Finished;
                    }
                }
            }

            match socket.read() {
                Ok(Message::Text(text)) => self.on_frame(&mut socket, &text),
                Ok(Message::Close(_)) => return SessionEnd::Lost,
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(_) => return SessionEnd::Lost,
            }
        }
    }

    fn on_frame(&mut self, socket: &mut WebSocket<MaybeTlsStream<TcpStream>>, frame: &str) {
        match WireMessage::from_json(frame) {
            Some(WireMessage::Connected { version }) => {
                self.log.debug(format!("server says hello ({version})"));
                let _ = self.notices.send(ServerNotice::Connected);
            }
            Some(WireMessage::Response { response }) => match self.pending.lock().take() {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => self.log.warn("response arrived with no pending request"),
            },
            Some(WireMessage::UpdateAvailable { configuration }) => {
                let _ = self
                    .notices
                    .send(ServerNotice::UpdateAvailable { configuration });
            }
            Some(WireMessage::Ping { ts }) => {
                let _ = socket.send(Message::Text(WireMessage::pong(ts).to_json().into()));
            }
            Some(_) => {}
            None => self.log.warn(format!("unreadable frame: {frame}")),
        }
    }

    fn fail_pending(&self) {
        // dropping the sender wakes the waiting caller with ConnectionLost
        self.pending.lock().take();
    }
}
