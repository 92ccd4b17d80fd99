//! Server endpoint: accepts connections and multiplexes them onto a single
//! read stream.
//!
//! All connection state lives inside one dispatcher task that selects over
//! the socket, the epoch timer, and the command channel, so every mutation
//! is serialized without locks. The [`Server`] handle forwards API calls to
//! the dispatcher and awaits its answer.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::conn::{Connection, DrainReason};
use crate::error::LspError;
use crate::params::Params;
use crate::wire::{Message, RECV_BUFFER};

enum Command {
    Write {
        conn_id: u32,
        payload: Bytes,
        done: oneshot::Sender<Result<(), LspError>>,
    },
    CloseConn {
        conn_id: u32,
        done: oneshot::Sender<Result<(), LspError>>,
    },
    Close {
        done: oneshot::Sender<Result<(), LspError>>,
    },
}

type ReadEvent = Result<(u32, Bytes), LspError>;

/// A running LSP server.
///
/// Dropping the handle aborts the dispatcher; prefer [`Server::close`] to
/// drain every connection first.
pub struct Server {
    local_addr: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<Command>,
    read_rx: Mutex<mpsc::UnboundedReceiver<ReadEvent>>,
    dispatcher: JoinHandle<()>,
}

impl Server {
    /// Bind on `port` (0 picks an ephemeral port) and start serving.
    ///
    /// # Errors
    /// Returns [`LspError::Io`] when the socket cannot be bound.
    pub async fn bind(port: u16, params: Params) -> Result<Self, LspError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = socket.local_addr()?;
        debug!(target: "liveseq::server", %local_addr, params = %params, "listening");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(
            Dispatcher {
                socket,
                params,
                cmd_rx,
                read_tx,
                conns: HashMap::new(),
                accepted: HashMap::new(),
                next_conn_id: 1,
                closing: None,
                lost_during_close: None,
            }
            .run(),
        );

        Ok(Self {
            local_addr,
            cmd_tx,
            read_rx: Mutex::new(read_rx),
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Read the next payload available from any client.
    ///
    /// # Errors
    /// Returns [`LspError::ConnectionLost`] or [`LspError::ConnectionClosed`]
    /// exactly once per affected connection (after that connection's queued
    /// payloads), and [`LspError::EndpointClosed`] once the server is down.
    pub async fn read(&self) -> Result<(u32, Bytes), LspError> {
        let mut rx = self.read_rx.lock().await;
        match rx.recv().await {
            Some(event) => event,
            None => Err(LspError::EndpointClosed),
        }
    }

    /// Queue one payload for reliable delivery to `conn_id`. Never blocks on
    /// the network: this resolves as soon as the dispatcher accepts the
    /// payload.
    ///
    /// # Errors
    /// Fails for an unknown connection id or one that is no longer active.
    pub async fn write(&self, conn_id: u32, payload: Bytes) -> Result<(), LspError> {
        self.command(|done| Command::Write { conn_id, payload, done }).await
    }

    /// Begin draining one connection. Does not wait for the drain: pending
    /// and windowed messages are still delivered and acknowledged, and the
    /// connection's final [`LspError::ConnectionClosed`] surfaces through
    /// [`Server::read`] when the drain completes.
    ///
    /// # Errors
    /// Fails for an unknown connection id.
    pub async fn close_conn(&self, conn_id: u32) -> Result<(), LspError> {
        self.command(|done| Command::CloseConn { conn_id, done }).await
    }

    /// Shut the server down, blocking until every connection has drained or
    /// been lost.
    ///
    /// # Errors
    /// Returns [`LspError::ConnectionLost`] when a client disappeared during
    /// the drain.
    pub async fn close(&self) -> Result<(), LspError> {
        self.command(|done| Command::Close { done }).await
    }

    async fn command<F>(&self, build: F) -> Result<(), LspError>
    where
        F: FnOnce(oneshot::Sender<Result<(), LspError>>) -> Command,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(done_tx))
            .map_err(|_| LspError::EndpointClosed)?;
        done_rx.await.map_err(|_| LspError::EndpointClosed)?
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Owns the socket and every connection; the single writer of server state.
struct Dispatcher {
    socket: UdpSocket,
    params: Params,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    read_tx: mpsc::UnboundedSender<ReadEvent>,
    conns: HashMap<u32, Connection>,
    /// (remote address, ISN) of every live connection, for the idempotent
    /// handshake: a retransmitted Connect gets the same ack again.
    accepted: HashMap<(SocketAddr, u32), u32>,
    next_conn_id: u32,
    closing: Option<oneshot::Sender<Result<(), LspError>>>,
    lost_during_close: Option<u32>,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut epoch = time::interval_at(
            Instant::now() + self.params.epoch(),
            self.params.epoch(),
        );

        loop {
            tokio::select! {
                _ = epoch.tick() => {
                    self.on_epoch().await;
                    if self.maybe_finish_close() {
                        break;
                    }
                }

                recv = self.socket.recv_from(&mut buf) => {
                    let Ok((n, addr)) = recv else { continue };
                    let Ok(msg) = Message::decode(&buf[..n]) else { continue };
                    self.on_datagram(msg, addr).await;
                    if self.maybe_finish_close() {
                        break;
                    }
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        self.on_command(cmd).await;
                        if self.maybe_finish_close() {
                            break;
                        }
                    }
                    None => break, // handle dropped
                }
            }
        }
        debug!(target: "liveseq::server", "dispatcher exiting");
    }

    async fn on_datagram(&mut self, msg: Message, addr: SocketAddr) {
        trace!(target: "liveseq::server", msg = %msg, %addr, "<-");
        match msg {
            Message::Connect { seq: isn, .. } => self.on_connect(addr, isn).await,
            Message::Data { conn_id, seq, payload, .. } => {
                let Some(conn) = self.conns.get_mut(&conn_id) else { return };
                let remote = conn.remote();
                let (ack, ready) = conn.handle_data(seq, payload);
                let _ = self.socket.send_to(&ack.encode(), remote).await;
                for payload in ready {
                    let _ = self.read_tx.send(Ok((conn_id, payload)));
                }
            }
            Message::Ack { conn_id, seq } => self.on_ack(conn_id, seq, false).await,
            Message::CAck { conn_id, seq } => self.on_ack(conn_id, seq, true).await,
        }
    }

    async fn on_connect(&mut self, addr: SocketAddr, isn: u32) {
        if self.closing.is_some() {
            return;
        }
        if let Some(&conn_id) = self.accepted.get(&(addr, isn)) {
            // Our ack was lost and the client retried; answer again.
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                conn.note_activity();
                conn.note_sent();
            }
            let _ = self.socket.send_to(&Message::ack(conn_id, isn).encode(), addr).await;
            return;
        }
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let mut conn = Connection::new(conn_id, addr, isn, self.params.clone());
        conn.note_sent();
        self.conns.insert(conn_id, conn);
        self.accepted.insert((addr, isn), conn_id);
        debug!(target: "liveseq::server", conn_id, %addr, isn, "accepted connection");
        let _ = self.socket.send_to(&Message::ack(conn_id, isn).encode(), addr).await;
    }

    async fn on_ack(&mut self, conn_id: u32, seq: u32, cumulative: bool) {
        let Some(conn) = self.conns.get_mut(&conn_id) else { return };
        let remote = conn.remote();
        let released = if cumulative {
            conn.handle_cack(seq)
        } else {
            conn.handle_ack(seq)
        };
        for msg in released {
            let _ = self.socket.send_to(&msg.encode(), remote).await;
        }
        if conn.is_draining() && conn.drained() {
            self.finish_conn(conn_id);
        }
    }

    async fn on_epoch(&mut self) {
        let ids: Vec<u32> = self.conns.keys().copied().collect();
        for conn_id in ids {
            let Some(conn) = self.conns.get_mut(&conn_id) else { continue };
            let remote = conn.remote();
            let actions = conn.on_epoch();
            if actions.lost {
                self.conns.remove(&conn_id);
                self.accepted.retain(|_, id| *id != conn_id);
                if self.closing.is_some() {
                    self.lost_during_close.get_or_insert(conn_id);
                } else {
                    let _ = self.read_tx.send(Err(LspError::ConnectionLost { conn_id }));
                }
                continue;
            }
            for msg in actions.send {
                let _ = self.socket.send_to(&msg.encode(), remote).await;
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Write { conn_id, payload, done } => {
                let result = match self.conns.get_mut(&conn_id) {
                    None => Err(LspError::UnknownConnection(conn_id)),
                    Some(conn) if !conn.is_active() => {
                        Err(LspError::ConnectionClosed { conn_id })
                    }
                    Some(conn) => {
                        let remote = conn.remote();
                        let msgs = conn.write(payload);
                        for msg in msgs {
                            let _ = self.socket.send_to(&msg.encode(), remote).await;
                        }
                        Ok(())
                    }
                };
                let _ = done.send(result);
            }
            Command::CloseConn { conn_id, done } => {
                let result = match self.conns.get_mut(&conn_id) {
                    None => Err(LspError::UnknownConnection(conn_id)),
                    Some(conn) => {
                        conn.begin_drain(DrainReason::LocalClose);
                        if conn.drained() {
                            self.finish_conn(conn_id);
                        }
                        Ok(())
                    }
                };
                let _ = done.send(result);
            }
            Command::Close { done } => {
                if self.closing.is_some() {
                    let _ = done.send(Err(LspError::EndpointClosed));
                    return;
                }
                debug!(target: "liveseq::server", conns = self.conns.len(), "closing server");
                for conn in self.conns.values_mut() {
                    conn.begin_drain(DrainReason::Shutdown);
                }
                let drained: Vec<u32> = self
                    .conns
                    .iter()
                    .filter(|(_, conn)| conn.drained())
                    .map(|(id, _)| *id)
                    .collect();
                for conn_id in drained {
                    self.finish_conn(conn_id);
                }
                self.closing = Some(done);
            }
        }
    }

    /// Remove a fully drained connection and surface its terminal event.
    fn finish_conn(&mut self, conn_id: u32) {
        let Some(mut conn) = self.conns.remove(&conn_id) else { return };
        conn.finish_close();
        self.accepted.retain(|_, id| *id != conn_id);
        if conn.drain_reason() == Some(DrainReason::LocalClose) {
            let _ = self.read_tx.send(Err(LspError::ConnectionClosed { conn_id }));
        }
        debug!(target: "liveseq::server", conn_id, "connection closed");
    }

    fn maybe_finish_close(&mut self) -> bool {
        if self.closing.is_none() || !self.conns.is_empty() {
            return false;
        }
        let result = match self.lost_during_close {
            Some(conn_id) => Err(LspError::ConnectionLost { conn_id }),
            None => Ok(()),
        };
        if let Some(done) = self.closing.take() {
            let _ = done.send(result);
        }
        true
    }
}
