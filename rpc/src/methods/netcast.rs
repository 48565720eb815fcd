// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! `blade.netcast`: upstream-originated broadcasts of cluster state
//! changes. The outer request names a command; `params` decodes into the
//! per-command record.

use super::protocol::{default_rank, AccessControl, Channel};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The method name for a netcast request.
pub const NETCAST_METHOD: &str = "blade.netcast";

pub const CMD_ROUTE_ADD: &str = "route.add";
pub const CMD_ROUTE_REMOVE: &str = "route.remove";
pub const CMD_IDENTITY_ADD: &str = "identity.add";
pub const CMD_IDENTITY_REMOVE: &str = "identity.remove";
pub const CMD_PROTOCOL_ADD: &str = "protocol.add";
pub const CMD_PROTOCOL_REMOVE: &str = "protocol.remove";
pub const CMD_PROTOCOL_PROVIDER_ADD: &str = "protocol.provider.add";
pub const CMD_PROTOCOL_PROVIDER_REMOVE: &str = "protocol.provider.remove";
pub const CMD_PROTOCOL_PROVIDER_RANK_UPDATE: &str = "protocol.provider.rank.update";
pub const CMD_PROTOCOL_PROVIDER_DATA_UPDATE: &str = "protocol.provider.data.update";
pub const CMD_SUBSCRIPTION_ADD: &str = "subscription.add";
pub const CMD_SUBSCRIPTION_REMOVE: &str = "subscription.remove";
pub const CMD_AUTHORITY_ADD: &str = "authority.add";
pub const CMD_AUTHORITY_REMOVE: &str = "authority.remove";
pub const CMD_AUTHORIZATION_ADD: &str = "authorization.add";
pub const CMD_AUTHORIZATION_UPDATE: &str = "authorization.update";
pub const CMD_AUTHORIZATION_REMOVE: &str = "authorization.remove";
pub const CMD_ACCESS_ADD: &str = "access.add";
pub const CMD_ACCESS_REMOVE: &str = "access.remove";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetcastRequest {
    pub command: String,
    #[serde(default)]
    pub certified_only: bool,
    pub netcaster_nodeid: String,
    pub params: Value,
}

impl NetcastRequest {
    /// Decode `params` into the record for this command.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolAddParams {
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolRemoveParams {
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAddParams {
    pub protocol: String,
    pub nodeid: String,
    #[serde(default)]
    pub default_method_execute_access: AccessControl,
    #[serde(default)]
    pub default_channel_subscribe_access: AccessControl,
    #[serde(default)]
    pub default_channel_broadcast_access: AccessControl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<Channel>>,
    #[serde(default = "default_rank")]
    pub rank: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRemoveParams {
    pub protocol: String,
    pub nodeid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRankUpdateParams {
    pub protocol: String,
    pub nodeid: String,
    #[serde(default = "default_rank")]
    pub rank: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDataUpdateParams {
    pub protocol: String,
    pub nodeid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityParams {
    pub nodeid: String,
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub protocol: String,
    pub nodeid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityParams {
    pub nodeid: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_decode_per_command() {
        let request: NetcastRequest = serde_json::from_value(json!({
            "command": CMD_PROTOCOL_PROVIDER_ADD,
            "netcaster_nodeid": "n0",
            "params": {
                "protocol": "bobo_protocol",
                "nodeid": "n1",
                "channels": [{"name": "bobo_channel", "broadcast_access": 1, "subscribe_access": 1}],
            },
        }))
        .unwrap();
        assert!(!request.certified_only);

        let params: ProviderAddParams = request.params().unwrap();
        assert_eq!(params.rank, 1);
        assert_eq!(params.channels.unwrap().len(), 1);
        assert_eq!(
            params.default_method_execute_access,
            AccessControl::System
        );
    }
}
