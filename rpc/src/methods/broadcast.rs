// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! `blade.broadcast`: fire-and-forget pub/sub events on a protocol channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The method name for a broadcast request. Broadcasts carry NOREPLY
/// semantics; nobody replies to them.
pub const BROADCAST_METHOD: &str = "blade.broadcast";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub protocol: String,
    pub channel: String,
    pub event: String,
    pub broadcaster_nodeid: String,
    pub params: Value,
}
