//! RPC layer between the UI and the filesystem engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  send()   ┌────────────────────────────┐  frames   ┌──────────────┐
//! │      UI      │──────────►│ RpcClient worker           │──────────►│   engine     │
//! │              │◄──────────│  Registry · FrameDecoder   │◄──────────│ (child proc  │
//! │              │  adapter  │  Supervisor → Transport    │           │  or TCP)     │
//! └──────────────┘           └────────────────────────────┘           └──────────────┘
//! ```
//!
//! The engine is either spawned as `<engine> daemon` and spoken to over its
//! standard streams ([`ProcessConnector`]) or reached over TCP
//! ([`SocketConnector`]). Both carry the same tag + length framing, see
//! [`framing`].
//!
//! # Usage
//!
//! ```ignore
//! use futurecommander_client::config::ClientConfig;
//! use futurecommander_client::ipc::RpcClient;
//! use futurecommander_client::models::Request;
//!
//! let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let client = RpcClient::from_config(&ClientConfig::from_env()?, events_tx);
//! let response = client.send(Request::directory_create("/tmp/new", true, false)).await?;
//! ```

mod adapter;
mod client;
mod error;
pub mod framing;
mod registry;
mod supervisor;
mod transport;

pub use adapter::{ActionAdapter, Discard};
pub use client::{ClientStats, RpcClient};
pub use error::{ErrorKind, FrameError, RpcError, TransportError};
pub use framing::{encode_event, encode_frame, encode_request, encode_response, FrameDecoder, FrameTag};
pub use registry::{Completion, Registry};
pub use supervisor::{RestartDecision, RestartPolicy, Supervisor};
pub use transport::{
    CloseReason, Connector, Link, ProcessConnector, SocketConnector, Transport, TransportEvent,
    TransportKind, TransportSignal, DAEMON_ARG, DEFAULT_SOCKET_ADDR,
};
