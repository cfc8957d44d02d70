//! An echo service over reliable-connected RDMA.
//!
//! The server accepts connections and sends every message straight back;
//! the client connects, sends what it reads, and reports the replies. All
//! data movement is completion-driven: a background poller per transport
//! context sleeps on the completion channel and hands each completion to
//! the role's [`CompletionHandler`], while the connection manager's events
//! are driven by a blocking loop on the caller's thread.
//!
//! Resources are layered the same way on both sides:
//!
//! - a [`TransportContext`] per device (protection domain, one completion
//!   queue and its channel), built lazily by a [`TransportSlot`];
//! - a [`PeerConnection`] per connected endpoint (queue pair and two
//!   registered [`BUFFER_SIZE`](echo::message::BUFFER_SIZE)-byte buffers);
//! - the client and server state machines in [`cm`].
//!
//! Everything is generic over a [`provider`]. [`provider::sim`] is an
//! in-process fabric used by the tests; the `verbs` feature adds
//! `provider::verbs`, backed by `libibverbs` and `librdmacm`.
//!
//! # Example
//!
//! ```rust
//! use std::sync::mpsc;
//! use std::thread;
//! use rdma_echo::{provider::sim::SimProvider, EchoClient, EchoConfig, EchoServer};
//!
//! fn main() -> anyhow::Result<()> {
//!     let provider = SimProvider::new();
//!     let config = EchoConfig::default();
//!
//!     let server = EchoServer::bind(provider.clone(), &config, "127.0.0.1:20079".parse()?)?;
//!     let addr = server.local_addr().unwrap();
//!     thread::spawn(move || server.serve());
//!
//!     let (input, lines) = mpsc::channel();
//!     input.send("ping".to_owned())?;
//!     input.send("exit".to_owned())?;
//!
//!     let (replies, received) = mpsc::channel();
//!     EchoClient::new(provider, config).run(addr, lines, replies)?;
//!     assert_eq!(received.recv()?.text(), "ping");
//!     Ok(())
//! }
//! ```

#[cfg(feature = "verbs")]
mod bindings;

#[cfg(feature = "verbs")]
#[macro_use]
mod utils;

pub mod cm;
pub mod echo;
pub mod provider;
pub mod rdma;

mod client;
mod config;
mod context;
mod error;
mod peer;
mod poller;
mod server;

pub use client::{ClientSummary, EchoClient, Reply, EXIT_SENTINEL};
pub use config::{ConfigError, EchoConfig};
pub use context::{TransportContext, TransportSlot};
pub use echo::ServerStats;
pub use error::{Error, Result};
pub use peer::{Buffers, ConnId, PeerConnection};
pub use poller::CompletionHandler;
pub use server::EchoServer;
