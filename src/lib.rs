#![deny(unsafe_code)]

//! Live Sequence Protocol (LSP) — reliable, in-order message transport
//! layered on UDP.
//!
//! LSP keeps the guarantees of a stream transport while preserving message
//! boundaries: each connection delivers whole payloads, in order, exactly
//! once, over an unreliable datagram substrate. Reliability comes from
//! sliding-window flow control with per-message exponential back-off,
//! point and cumulative acknowledgments, and an epoch timer that doubles
//! as keep-alive and failure detector.
//!
//! A [`Server`] multiplexes any number of client connections onto a single
//! read stream; a [`Client`] drives one connection. Both expose the same
//! shape of API: blocking `read`, non-blocking `write`, draining `close`.
//!
//! Example (echo round-trip)
//! ```no_run
//! use bytes::Bytes;
//! use liveseq::{Client, Params, Server};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), liveseq::LspError> {
//! let server = Server::bind(9999, Params::default()).await?;
//! let client = Client::connect("127.0.0.1:9999".parse().unwrap(), 42, Params::default()).await?;
//!
//! client.write(Bytes::from_static(b"ping"))?;
//! let (conn_id, payload) = server.read().await?;
//! server.write(conn_id, payload).await?;
//! let echoed = client.read().await?;
//! assert_eq!(echoed, Bytes::from_static(b"ping"));
//!
//! client.close().await?;
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod client;
pub mod error;
pub mod params;
pub mod server;
pub mod wire;

mod conn;

pub use client::Client;
pub use error::LspError;
pub use params::Params;
pub use server::Server;
pub use wire::Message;
