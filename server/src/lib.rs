//! # SOE Server Library
//!
//! This library provides the server side of the SOE reliable-UDP transport.
//! It accepts client sessions on a single UDP socket, gives every session a
//! sequenced and acknowledged data channel, and hands complete application
//! messages to a user-supplied dispatcher.
//!
//! ## Core Responsibilities
//!
//! ### Session Management
//! Every peer is tracked as a `Connection` keyed by endpoint and by the
//! session id it announced. The connection manager enforces that both are
//! unique among live sessions, assigns each session the lowest free slot,
//! and drops sessions that go quiet for longer than the client timeout.
//!
//! ### Reliable Delivery
//! Each connection owns a `DataChannel` that:
//! - Accepts data only in sequence and acknowledges what it accepts
//! - Answers gaps with an out-of-order notice
//! - Reassembles fragmented messages and sends partial acknowledgments
//! - Numbers outbound data and keeps the fragments of one message together
//!
//! Outbound data is sent once; lost packets are not retransmitted.
//!
//! ## Architecture Design
//!
//! ### Receive Loop and Worker Pools
//! One task reads the socket. Each datagram is resolved to its connection
//! and pushed onto the packet queue, partitioned by endpoint so a client's
//! packets are always processed in order by the same worker. Reassembled
//! messages go through a second partitioned queue to the message workers,
//! which call the dispatcher. Either pool can be switched off, in which case
//! the work runs inline on the previous stage.
//!
//! ### Keep-Alive
//! A separate task sweeps the connection table on a fixed period and
//! disconnects idle clients with reason `Timeout`.
//!
//! ### Shutdown
//! `ServerHandle::stop` flips a watch flag observed by every loop. The
//! receive loop, the workers and the keep-alive task all exit on their next
//! wakeup and `Server::run` returns once they have finished.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Server and daemon options read from JSON with LibSOE option names.
//!
//! ### Connection Modules (`connection`, `connection_manager`)
//! Per-client state and the registry of live connections.
//!
//! ### Data Channel Module (`data_channel`)
//! Sequencing, acknowledgment, fragmentation and reassembly.
//!
//! ### Network Module (`network`)
//! The UDP socket, receive loop, keep-alive task and `ServerHandle`.
//!
//! ### Protocol Module (`protocol`)
//! Packet routing and the `Dispatcher` trait applications implement.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use soe_server::{Connection, Dispatcher, Server, ServerConfig, ServerHandle};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Dispatcher for Echo {
//!     fn handle_message(&self, server: &ServerHandle, connection: &Arc<Connection>, message: &[u8]) {
//!         let _ = server.send_message(connection, message.to_vec());
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ServerConfig::default();
//!     config.port = 20260;
//!
//!     let server = Server::bind(config, Arc::new(Echo)).await?;
//!     let handle = server.handle();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         handle.stop();
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod data_channel;
pub mod error;
pub mod network;
pub mod protocol;
pub mod queue;
mod utils;

pub use config::{DaemonConfig, ServerConfig};
pub use connection::Connection;
pub use connection_manager::ConnectionManager;
pub use data_channel::DataChannel;
pub use error::{ConnectError, ServerError};
pub use network::{PacketSink, Server, ServerHandle, SocketSink};
pub use protocol::{Dispatcher, LoggingDispatcher, PacketRouter};
