//! Errors surfaced by the client and server endpoints.

use thiserror::Error;

/// Failures reported through the public read/write/close API.
///
/// Corruption, duplication, and reordering on the wire are absorbed by the
/// protocol engine and never appear here.
#[derive(Debug, Error)]
pub enum LspError {
    /// The peer went silent for the configured epoch limit.
    #[error("connection {conn_id} lost: no message from peer within the epoch limit")]
    ConnectionLost { conn_id: u32 },

    /// The connection was closed locally and has finished draining.
    #[error("connection {conn_id} closed")]
    ConnectionClosed { conn_id: u32 },

    /// The local endpoint has shut down; all further calls fail.
    #[error("endpoint closed")]
    EndpointClosed,

    /// The server never acknowledged our connect request.
    #[error("connect handshake timed out")]
    HandshakeFailed,

    /// No connection with the given id exists on this server.
    #[error("unknown connection id {0}")]
    UnknownConnection(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
