// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! Classification of inbound text frames.
//!
//! A frame carrying `method`/`params` is a request originated by the
//! upstream; anything else is matched by `id` against the pending map.

use serde::Deserialize;
use serde_json::value::RawValue;
use uuid::Uuid;

/// One inbound JSON-RPC 2.0 frame.
#[derive(Debug)]
pub enum RpcFrame {
    /// An inbound request (e.g. `blade.broadcast`, `blade.execute`).
    Request {
        id: Uuid,
        method: String,
        params: Box<RawValue>,
    },
    /// A reply carrying a `result` member.
    Result { id: Uuid, result: Box<RawValue> },
    /// A reply carrying an `error` member.
    Error { id: Uuid, error: Box<RawValue> },
}

impl RpcFrame {
    /// The correlation id of the frame.
    pub fn id(&self) -> Uuid {
        match self {
            RpcFrame::Request { id, .. } => *id,
            RpcFrame::Result { id, .. } => *id,
            RpcFrame::Error { id, .. } => *id,
        }
    }
}

impl std::str::FromStr for RpcFrame {
    type Err = serde_json::Error;

    fn from_str(frame: &str) -> Result<Self, Self::Err> {
        #[derive(Deserialize)]
        struct Request {
            #[allow(unused)]
            jsonrpc: String,
            id: Uuid,
            method: String,
            params: Box<RawValue>,
        }

        #[derive(Deserialize)]
        struct Response {
            #[allow(unused)]
            jsonrpc: String,
            id: Uuid,
            result: Box<RawValue>,
        }

        #[derive(Deserialize)]
        struct ResponseError {
            #[allow(unused)]
            jsonrpc: String,
            id: Uuid,
            error: Box<RawValue>,
        }

        // Try the request shape first; a request always carries params,
        // which neither reply shape does.
        let first_err = match serde_json::from_str::<Request>(frame) {
            Ok(rqu) => {
                return Ok(RpcFrame::Request {
                    id: rqu.id,
                    method: rqu.method,
                    params: rqu.params,
                });
            }
            Err(e) => e,
        };
        if let Ok(rpl) = serde_json::from_str::<Response>(frame) {
            return Ok(RpcFrame::Result {
                id: rpl.id,
                result: rpl.result,
            });
        }
        if let Ok(rpl) = serde_json::from_str::<ResponseError>(frame) {
            return Ok(RpcFrame::Error {
                id: rpl.id,
                error: rpl.error,
            });
        }

        Err(first_err)
    }
}
