//! Websocket gateway for the update protocol.
//!
//! Two threads own all socket io: an acceptor doing blocking handshakes
//! off a non-blocking listener, and a reader polling every peer for
//! frames. Requests are answered inline through the server command
//! table; pushes go out through [`Broadcaster`].

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tungstenite::WebSocket;
use tungstenite::protocol::Message;

use crate::logger::Logger;
use crate::protocol::WireMessage;
use crate::server::ServerCommands;

/// Maximum port retry attempts.
const MAX_PORT_RETRIES: u16 = 10;
/// Poll interval for the accept and reader loops.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

type Peers = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Try binding to a port, retrying with incremented ports if in use.
fn try_bind_port(
    log: &Logger,
    host: &str,
    base_port: u16,
    max_retries: u16,
) -> anyhow::Result<(TcpListener, u16)> {
    let mut last_error = None;

    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        match TcpListener::bind((host, port)) {
            Ok(listener) => {
                let actual_port = listener.local_addr()?.port();
                if offset > 0 {
                    log.warn(format!("port {base_port} in use; moved to {actual_port}"));
                }
                return Ok((listener, actual_port));
            }
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        }
    }

    Err(anyhow::anyhow!(
        "failed to bind websocket gateway after {} attempts: {}",
        max_retries,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Push side of the gateway; cheap to clone into subscribers.
#[derive(Clone)]
pub struct Broadcaster {
    log: Logger,
    peers: Peers,
}

impl Broadcaster {
    /// Tell every connected client that `configuration` has a new update.
    pub fn update_available(&self, configuration: &str) {
        self.send_all(WireMessage::update_available(configuration));
    }

    fn send_all(&self, message: WireMessage) {
        let frame = message.to_json();
        let mut peers = self.peers.lock();
        let count = peers.len();

        if count == 0 {
            self.log.debug("no clients connected");
            return;
        }

        peers.retain_mut(|peer| match peer.send(Message::Text(frame.clone().into())) {
            Ok(_) => true,
            Err(e) => {
                self.log.debug(format!("client disconnected: {e}"));
                false
            }
        });
        self.log.debug(format!("broadcast to {count} clients"));
    }
}

pub struct WsGateway {
    log: Logger,
    port: u16,
    peers: Peers,
    shutdown: Sender<()>,
}

impl WsGateway {
    /// Bind, spawn the io threads, and start answering the protocol.
    pub fn serve(
        log: &Logger,
        commands: Arc<ServerCommands>,
        host: &str,
        base_port: u16,
    ) -> anyhow::Result<Self> {
        let log = log.scoped("ws");
        let (listener, port) = try_bind_port(&log, host, base_port, MAX_PORT_RETRIES)?;
        listener.set_nonblocking(true)?;

        let peers: Peers = Arc::new(Mutex::new(Vec::new()));
        // one slot per thread
        let (shutdown_tx, shutdown_rx) = bounded::<()>(2);
        let handle = Handle::current();

        {
            let log = log.clone();
            let peers = Arc::clone(&peers);
            let shutdown = shutdown_rx.clone();
            thread::spawn(move || accept_loop(log, listener, peers, shutdown));
        }
        {
            let log = log.clone();
            let peers = Arc::clone(&peers);
            thread::spawn(move || reader_loop(log, commands, handle, peers, shutdown_rx));
        }

        log.info(format!("update gateway on ws://{host}:{port}"));
        Ok(Self {
            log,
            port,
            peers,
            shutdown: shutdown_tx,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster {
            log: self.log.clone(),
            peers: Arc::clone(&self.peers),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Stop both io threads and close every peer.
    pub fn shutdown(&self) {
        let _ = self.shutdown.try_send(());
        let _ = self.shutdown.try_send(());
        let mut peers = self.peers.lock();
        for peer in peers.iter_mut() {
            let _ = peer.close(None);
        }
        peers.clear();
        self.log.debug("websocket gateway closed");
    }
}

fn accept_loop(log: Logger, listener: TcpListener, peers: Peers, shutdown: Receiver<()>) {
    loop {
        if shutdown.try_recv().is_ok() {
            return;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                // Blocking mode for the handshake, non-blocking for
                // polling reads afterwards.
                let _ = stream.set_nonblocking(false);
                match tungstenite::accept(stream) {
                    Ok(mut ws) => {
                        let greeting = WireMessage::connected();
                        if let Err(e) = ws.send(Message::Text(greeting.to_json().into())) {
                            log.debug(format!("failed to greet {addr}: {e}"));
                            continue;
                        }
                        if ws.get_ref().set_nonblocking(true).is_err() {
                            continue;
                        }
                        let mut peers = peers.lock();
                        log.debug(format!(
                            "client connected from {addr} (total: {})",
                            peers.len() + 1
                        ));
                        peers.push(ws);
                    }
                    Err(e) => log.debug(format!("handshake failed for {addr}: {e}")),
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                log.error(format!("accept error: {e}"));
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn reader_loop(
    log: Logger,
    commands: Arc<ServerCommands>,
    handle: Handle,
    peers: Peers,
    shutdown: Receiver<()>,
) {
    loop {
        if shutdown.try_recv().is_ok() {
            return;
        }
        thread::sleep(POLL_INTERVAL);

        let mut peers_guard = peers.lock();
        let mut disconnected = Vec::new();

        for (i, peer) in peers_guard.iter_mut().enumerate() {
            match peer.read() {
                Ok(Message::Text(text)) => {
                    if let Some(reply) = answer(&log, &commands, &handle, &text) {
                        if peer.send(Message::Text(reply.into())).is_err() {
                            disconnected.push(i);
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    disconnected.push(i);
                }
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    // No data available, continue
                }
                Err(_) => {
                    disconnected.push(i);
                }
                _ => {}
            }
        }

        for i in disconnected.into_iter().rev() {
            peers_guard.remove(i);
            log.debug("client disconnected");
        }
    }
}

/// Answer one inbound frame, if it warrants a reply.
fn answer(log: &Logger, commands: &Arc<ServerCommands>, handle: &Handle, frame: &str) -> Option<String> {
    match WireMessage::from_json(frame) {
        Some(WireMessage::Request { request }) => {
            match handle.block_on(commands.reconcile.execute(request)) {
                Ok(response) => Some(WireMessage::response(response).to_json()),
                Err(err) => {
                    log.error(format!("reconcile failed: {err:#}"));
                    None
                }
            }
        }
        Some(WireMessage::Ping { ts }) => Some(WireMessage::pong(ts).to_json()),
        Some(_) => None,
        None => {
            log.debug(format!("unreadable frame: {frame}"));
            None
        }
    }
}
