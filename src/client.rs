//! Client endpoint: a single connection to an LSP server.
//!
//! [`Client::connect`] performs the handshake synchronously, then spawns a
//! driver task that owns the connection state machine and the socket. The
//! returned handle talks to the driver over channels, so `write` never
//! blocks on the network and `read` blocks only on delivery.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

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

const STATE_ACTIVE: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_LOST: u8 = 2;
const STATE_CLOSED: u8 = 3;

enum Command {
    Write(Bytes),
    Close(oneshot::Sender<Result<(), LspError>>),
}

/// A connected LSP client.
///
/// Dropping the handle aborts the driver task; prefer [`Client::close`] for
/// a graceful teardown that waits for outstanding acknowledgments.
pub struct Client {
    conn_id: u32,
    local_addr: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<Command>,
    data_rx: Mutex<mpsc::UnboundedReceiver<Result<Bytes, LspError>>>,
    state: Arc<AtomicU8>,
    driver: JoinHandle<()>,
}

impl Client {
    /// Connect to `remote`, using `initial_seq` as this connection's ISN.
    ///
    /// The connect request is retransmitted once per quiet epoch, with no
    /// back-off; after `epoch_limit` quiet epochs the attempt is abandoned.
    ///
    /// # Errors
    /// Returns [`LspError::HandshakeFailed`] when the server never answers,
    /// or [`LspError::Io`] for socket failures.
    pub async fn connect(
        remote: SocketAddr,
        initial_seq: u32,
        params: Params,
    ) -> Result<Self, LspError> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;
        let local_addr = socket.local_addr()?;

        let connect_frame = Message::connect(initial_seq).encode();
        socket.send(&connect_frame).await?;
        debug!(target: "liveseq::client", %remote, isn = initial_seq, "-> Connect");

        let mut buf = vec![0u8; RECV_BUFFER];
        let mut quiet_epochs = 0;
        let conn_id = loop {
            match time::timeout(params.epoch(), socket.recv(&mut buf)).await {
                Ok(Ok(n)) => match Message::decode(&buf[..n]) {
                    Ok(Message::Ack { conn_id, seq }) | Ok(Message::CAck { conn_id, seq })
                        if conn_id != 0 && seq == initial_seq =>
                    {
                        debug!(target: "liveseq::client", conn_id, "<- Ack, handshake complete");
                        break conn_id;
                    }
                    Ok(other) => {
                        trace!(target: "liveseq::client", msg = %other, "(handshake) ignoring");
                    }
                    Err(_) => {}
                },
                Ok(Err(err)) => return Err(err.into()),
                Err(_elapsed) => {
                    quiet_epochs += 1;
                    if quiet_epochs >= params.epoch_limit {
                        return Err(LspError::HandshakeFailed);
                    }
                    debug!(target: "liveseq::client", isn = initial_seq, "handshake timeout, resending Connect");
                    socket.send(&connect_frame).await?;
                }
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(STATE_ACTIVE));
        let conn = Connection::new(conn_id, remote, initial_seq, params.clone());
        let driver = tokio::spawn(drive(socket, conn, params, cmd_rx, data_tx, state.clone()));

        Ok(Self {
            conn_id,
            local_addr,
            cmd_tx,
            data_rx: Mutex::new(data_rx),
            state,
            driver,
        })
    }

    /// The server-assigned connection id.
    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Read the next in-order payload from the server.
    ///
    /// # Errors
    /// Returns [`LspError::ConnectionLost`] once, after every payload that
    /// arrived before the loss has been read, and [`LspError::EndpointClosed`]
    /// after the connection has been closed.
    pub async fn read(&self) -> Result<Bytes, LspError> {
        let mut rx = self.data_rx.lock().await;
        match rx.recv().await {
            Some(event) => event,
            None => Err(LspError::EndpointClosed),
        }
    }

    /// Queue one payload for reliable delivery. Never blocks: the payload is
    /// handed to the driver, which transmits it as the window allows.
    ///
    /// # Errors
    /// Fails once the connection has left its active state.
    pub fn write(&self, payload: Bytes) -> Result<(), LspError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_ACTIVE => {}
            STATE_LOST => return Err(LspError::ConnectionLost { conn_id: self.conn_id }),
            _ => return Err(LspError::ConnectionClosed { conn_id: self.conn_id }),
        }
        self.cmd_tx
            .send(Command::Write(payload))
            .map_err(|_| LspError::EndpointClosed)
    }

    /// Close the connection gracefully.
    ///
    /// Blocks until every written payload has been acknowledged by the
    /// server, or until the connection is declared lost.
    ///
    /// # Errors
    /// Returns [`LspError::ConnectionLost`] when the peer disappears during
    /// the drain, and [`LspError::EndpointClosed`] on a repeated close.
    pub async fn close(&self) -> Result<(), LspError> {
        match self.state.compare_exchange(
            STATE_ACTIVE,
            STATE_DRAINING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_LOST) => return Err(LspError::ConnectionLost { conn_id: self.conn_id }),
            Err(_) => return Err(LspError::EndpointClosed),
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close(done_tx))
            .map_err(|_| LspError::EndpointClosed)?;
        match done_rx.await {
            Ok(result) => result,
            // The driver exited before answering; it can only have been lost.
            Err(_) => match self.state.load(Ordering::SeqCst) {
                STATE_LOST => Err(LspError::ConnectionLost { conn_id: self.conn_id }),
                _ => Err(LspError::EndpointClosed),
            },
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Driver task: sole owner of the connection state and the socket, so every
/// state mutation is serialized here.
async fn drive(
    socket: UdpSocket,
    mut conn: Connection,
    params: Params,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    data_tx: mpsc::UnboundedSender<Result<Bytes, LspError>>,
    state: Arc<AtomicU8>,
) {
    let conn_id = conn.conn_id();
    let mut buf = vec![0u8; RECV_BUFFER];
    let mut epoch = time::interval_at(Instant::now() + params.epoch(), params.epoch());
    let mut close_waiter: Option<oneshot::Sender<Result<(), LspError>>> = None;

    loop {
        tokio::select! {
            _ = epoch.tick() => {
                let actions = conn.on_epoch();
                for msg in &actions.send {
                    let _ = socket.send(&msg.encode()).await;
                }
                if actions.lost {
                    state.store(STATE_LOST, Ordering::SeqCst);
                    let _ = data_tx.send(Err(LspError::ConnectionLost { conn_id }));
                    if let Some(done) = close_waiter.take() {
                        let _ = done.send(Err(LspError::ConnectionLost { conn_id }));
                    }
                    break;
                }
            }

            recv = socket.recv(&mut buf) => {
                let Ok(n) = recv else { continue };
                let Ok(msg) = Message::decode(&buf[..n]) else { continue };
                if msg.conn_id() != conn_id {
                    continue;
                }
                trace!(target: "liveseq::client", msg = %msg, "<-");
                match msg {
                    Message::Data { seq, payload, .. } => {
                        let (ack, ready) = conn.handle_data(seq, payload);
                        let _ = socket.send(&ack.encode()).await;
                        for payload in ready {
                            let _ = data_tx.send(Ok(payload));
                        }
                    }
                    Message::Ack { seq, .. } => {
                        for released in conn.handle_ack(seq) {
                            let _ = socket.send(&released.encode()).await;
                        }
                    }
                    Message::CAck { seq, .. } => {
                        for released in conn.handle_cack(seq) {
                            let _ = socket.send(&released.encode()).await;
                        }
                    }
                    Message::Connect { .. } => {}
                }
                if close_waiter.is_some() && conn.drained() {
                    conn.finish_close();
                    state.store(STATE_CLOSED, Ordering::SeqCst);
                    if let Some(done) = close_waiter.take() {
                        let _ = done.send(Ok(()));
                    }
                    break;
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Write(payload)) => {
                    if conn.is_active() {
                        for msg in conn.write(payload) {
                            let _ = socket.send(&msg.encode()).await;
                        }
                    }
                }
                Some(Command::Close(done)) => {
                    conn.begin_drain(DrainReason::LocalClose);
                    if conn.drained() {
                        conn.finish_close();
                        state.store(STATE_CLOSED, Ordering::SeqCst);
                        let _ = done.send(Ok(()));
                        break;
                    }
                    close_waiter = Some(done);
                }
                None => break, // handle dropped
            }
        }
    }
    debug!(target: "liveseq::client", conn_id, "driver exiting");
}
