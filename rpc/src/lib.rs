// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! This crate provides the transport and command layers of the Blade client:
//! a TLS WebSocket with a background reader and keepalive, the JSON-RPC 2.0
//! request/reply correlation engine with per-command TTLs, and the wire
//! types for every Blade method the client speaks.
//!
//! Most users will want the higher level session API in `blade-client`,
//! which is built on top of [`Connection`].

pub mod command;
pub mod connection;
pub mod frame;
pub mod methods;
pub mod tls;
pub mod transport;

mod ttl;

// Expose the most common things at the top level:
pub use command::{Command, CommandFlags, FailureStatus, Reply, ResponseFuture};
pub use connection::{ConnectParams, Connection, ConnectionHooks, ConnectionTarget, RequestHook};
pub use transport::{FailedHook, StatsSnapshot, TransportStats};

use serde::Deserialize;

/// The default time to live for a command awaiting a reply.
pub const DEFAULT_COMMAND_TTL_MS: u64 = 10_000;

/// Extra time a [`ResponseFuture`] waits beyond the command TTL before
/// giving up on the reply callback ever firing.
pub const RESPONSE_WAIT_GRACE_MS: u64 = 5_000;

/// The default upstream port when the target URI does not carry one.
pub const DEFAULT_PORT: u16 = 2100;

/// A JSON-RPC error object, decoded far enough to route on the code.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

/// This encapsulates any errors that could be emitted in this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The WebSocket layer failed (handshake, read or write).
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// The TCP/TLS/WebSocket handshake did not complete in time.
    #[error("connect timed out")]
    ConnectTimeout,
    /// TLS material could not be loaded or the client config rejected it.
    #[error("TLS setup failed: {0}")]
    Tls(String),
    /// Reading key/cert files from disk failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The transport is down; the session layer decides when to reconnect.
    #[error("the connection is disconnected")]
    Disconnected,
    /// The TTL heap is at capacity, the submit was failed locally.
    #[error("TTL tracker at capacity")]
    TtlCapacity,
    /// A command in the wrong state was handed to an API with state
    /// requirements, e.g. submitting a request as a result.
    #[error("invalid command state: {0}")]
    InvalidCommandState(&'static str),
    /// The upstream replied to a request with a JSON-RPC error object.
    #[error("rpc error: {0}")]
    Rpc(ErrorObject),
    /// The command completed with a failure instead of a reply.
    #[error("command failure ({status:?}): {reason}")]
    Failure {
        status: FailureStatus,
        reason: String,
    },
    /// The reply channel was dropped before a reply was delivered.
    #[error("the command reply channel was dropped")]
    Dropped,
}
