// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! `blade.execute`: a targeted RPC against a protocol provider.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The method name for an execute request.
pub const EXECUTE_METHOD: &str = "blade.execute";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_nodeid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_nodeid: Option<String>,
    pub protocol: String,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_nodeid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_nodeid: Option<String>,
    pub result: Value,
}

/// The error payload a responder manufactures when execute dispatch fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_nodeid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_nodeid: Option<String>,
    pub code: i64,
    pub message: String,
}

/// No handler is registered for the protocol/method pair.
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
/// The handler ran but returned an error.
pub const ERR_HANDLER_FAILED: i64 = -32603;
/// The handler returned success without setting a result or error.
pub const ERR_NO_RESULT_SET: i64 = -32607;
