//! # Bichannel Game Server Core
//!
//! This library is the connection and session subsystem of a multiplayer
//! game server: a long-running process that accepts many concurrent game
//! clients over a paired reliable (TCP) + unreliable (UDP) transport,
//! identifies each with a stable 16-bit ID, and hands received payloads to
//! extension code without blocking transport I/O.
//!
//! ## Core Responsibilities
//!
//! ### Session Establishment
//! Both channels bind to one address. Every accepted stream is issued a
//! random 64-bit auth token as its first 8 wire bytes; the peer proves
//! ownership of its datagram endpoint by echoing that token as its first
//! datagram. Only then is the session admitted and given a client ID.
//!
//! ### Framed Transport
//! Reliable traffic is `[u32 big-endian length][body]` frames with a
//! configurable body-length ceiling; oversized declarations are treated as
//! protocol violations and feed the per-session strike ledger. Datagrams
//! carry no prefix: the datagram boundary is the frame boundary.
//!
//! ### Event Fan-out
//! Extension callbacks run serialized on a single cooperative dispatcher
//! unless the extension declares itself thread-safe, in which case they run
//! directly on the I/O task that produced the event. A client's connected
//! callback always completes before its first payload is delivered.
//!
//! ## Module Organization
//!
//! - [`config`]: recognized configuration keys and their defaults
//! - `listener`: the bichannel acceptor, datagram routing, and the
//!   UDP-to-TCP auth handshake (crate-internal)
//! - [`connection`]: the per-session receive/send state machine
//! - [`client`] / [`client_manager`]: client identity, ID allocation,
//!   admission and teardown
//! - [`dispatcher`]: the serial callback queue
//! - [`events`]: the extension-facing callback trait and event payloads
//! - [`error`]: the error taxonomy
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use server::{Server, ServerConfig, ServerEvents};
//! use shared::NullSink;
//!
//! struct Echo;
//!
//! impl ServerEvents for Echo {
//!     fn message_received(
//!         &self,
//!         client: Arc<server::Client>,
//!         message: shared::MessageBuffer,
//!         _mode: server::ChannelMode,
//!     ) {
//!         let client = Arc::clone(&client);
//!         tokio::spawn(async move { client.send_reliable(message).await });
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), server::ServerError> {
//!     let server = Server::bind(
//!         ServerConfig::default(),
//!         Some(Arc::new(Echo)),
//!         Arc::new(NullSink),
//!     )
//!     .await?;
//!     println!("serving on {}", server.local_addr());
//!     loop {
//!         tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     }
//! }
//! ```

pub mod client;
pub mod client_manager;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
mod listener;
mod server;

pub use client::Client;
pub use config::ServerConfig;
pub use connection::{Connection, STRIKE_WEIGHT_PROTOCOL, STRIKE_WEIGHT_ROUTINE};
pub use dispatcher::Dispatcher;
pub use error::{DisconnectReason, ServerError};
pub use events::{ChannelMode, DisconnectEvent, HandlerError, ServerEvents};
pub use server::Server;
