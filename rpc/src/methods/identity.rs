// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! `blade.identity`: attach or drop identity URIs on this node.

use serde::{Deserialize, Serialize};

pub const IDENTITY_METHOD: &str = "blade.identity";

pub const CMD_ADD: &str = "add";
pub const CMD_REMOVE: &str = "remove";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRequest {
    pub command: String,
    pub identities: Vec<String>,
}
