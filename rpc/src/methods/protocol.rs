// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! The protocol data model (protocols, providers, channels, ACLs) and the
//! `blade.protocol` provider lifecycle requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The method name for protocol provider lifecycle requests.
pub const PROTOCOL_METHOD: &str = "blade.protocol";

pub const CMD_PROVIDER_ADD: &str = "provider.add";
pub const CMD_PROVIDER_REMOVE: &str = "provider.remove";
pub const CMD_PROVIDER_RANK_UPDATE: &str = "provider.rank.update";

/// Who may execute methods, subscribe, or broadcast on a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum AccessControl {
    /// Only certified nodes.
    System,
    /// Anyone.
    Public,
    /// Some uncertified nodes, depending on the authenticator.
    Restricted,
}

impl Default for AccessControl {
    fn default() -> Self {
        AccessControl::System
    }
}

impl From<AccessControl> for i32 {
    fn from(acl: AccessControl) -> i32 {
        match acl {
            AccessControl::System => 0,
            AccessControl::Public => 1,
            AccessControl::Restricted => 2,
        }
    }
}

impl TryFrom<i32> for AccessControl {
    type Error = String;
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AccessControl::System),
            1 => Ok(AccessControl::Public),
            2 => Ok(AccessControl::Restricted),
            other => Err(format!("unknown access control value {other}")),
        }
    }
}

/// A named pub/sub stream scoped to a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(default)]
    pub broadcast_access: AccessControl,
    #[serde(default)]
    pub subscribe_access: AccessControl,
}

/// One node providing a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub nodeid: String,
    /// Identity URIs advertised by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identities: Option<Vec<String>>,
    #[serde(default = "default_rank")]
    pub rank: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub(crate) fn default_rank() -> i32 {
    1
}

/// A named collection of methods and channels with one or more providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub name: String,
    #[serde(default)]
    pub default_method_execute_access: AccessControl,
    #[serde(default)]
    pub default_channel_broadcast_access: AccessControl,
    #[serde(default)]
    pub default_channel_subscribe_access: AccessControl,
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

/// Envelope params for all `blade.protocol` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolRequest {
    pub command: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Params of a `provider.add` protocol command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAddParams {
    #[serde(default)]
    pub default_method_execute_access: AccessControl,
    #[serde(default)]
    pub default_channel_subscribe_access: AccessControl,
    #[serde(default)]
    pub default_channel_broadcast_access: AccessControl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<Channel>>,
    #[serde(default = "default_rank")]
    pub rank: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Params of a `provider.rank.update` protocol command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRankUpdateParams {
    pub rank: i32,
}
