//! futurecommander client library
//!
//! Client-side RPC layer to the futurecommander filesystem engine:
//!
//! - `ipc` - framing, transports, supervision and the `RpcClient`
//! - `models` - requests, responses and push events exchanged with the engine
//! - `config` - environment-driven client configuration
//!
//! ```ignore
//! use futurecommander_client::config::ClientConfig;
//! use futurecommander_client::ipc::{Discard, RpcClient};
//!
//! let client = RpcClient::from_config(&ClientConfig::from_env()?, Discard);
//! let entries = client.list_directory("/home").await?;
//! ```

pub mod config;
pub mod ipc;
pub mod models;
