// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! Session layer for the Blade RPC/pub-sub fabric.
//!
//! A [`Session`] multiplexes JSON-RPC 2.0 requests, replies and broadcasts
//! over a single secure WebSocket to a cluster node, reconnects (resuming
//! the logical session when possible), dispatches inbound requests to user
//! handlers, and mirrors the cluster's routing/protocol/subscription state
//! in an in-memory [`NodeStore`].
//!
//! ```no_run
//! use blade_client::{Config, Session};
//!
//! # async fn demo() -> Result<(), blade_client::Error> {
//! let mut config = Config::default();
//! config.load_from_env();
//! let session = Session::new("wss://relay.example.com:2100", config)?;
//! session.connect();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod session;
pub mod store;

pub use config::Config;
pub use session::{ProviderSpec, Session, SessionState};
pub use store::NodeStore;

// The wire types travel with the session API.
pub use blade_rpc::methods;
pub use blade_rpc::{Command, FailureStatus, Reply, ResponseFuture};

/// This encapsulates any errors that could be emitted in this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An error from the transport/command layers.
    #[error(transparent)]
    Rpc(#[from] blade_rpc::Error),
    /// The target URI did not parse.
    #[error("invalid target uri: {0}")]
    Url(#[from] url::ParseError),
    /// The configuration cannot support a connect (e.g. no credentials).
    #[error("configuration error: {0}")]
    Config(String),
    /// A local argument was rejected before anything went on the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The session is not connected.
    #[error("the session is not connected")]
    NotConnected,
    /// A reply arrived but did not carry what the operation needed.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    /// `signalwire.setup` ran out of time waiting for the protocol to
    /// appear in the node store.
    #[error("setup for service '{0}' timed out waiting for its protocol")]
    SetupTimeout(String),
    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
