// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! `blade.connect`: the session handshake that authenticates the client,
//! optionally resumes a prior session, and seeds the node store.

use super::protocol::Protocol;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The method name for a connect request.
pub const CONNECT_METHOD: &str = "blade.connect";

/// The protocol version advertised in connect requests.
pub const VERSION: Version = Version {
    major: 2,
    minor: 0,
    revision: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

/// What the upstream should send this session via netcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFilter {
    pub route_data: bool,
    pub route_add: bool,
    pub route_remove: bool,
    pub authority_data: bool,
    pub authority_add: bool,
    pub authority_remove: bool,
    pub filtered_protocols: bool,
    /// With `filtered_protocols`, protocol netcasts arrive only for these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<String>>,
}

impl Default for NetworkFilter {
    /// Everything on, nothing filtered.
    fn default() -> Self {
        NetworkFilter {
            route_data: true,
            route_add: true,
            route_remove: true,
            authority_data: true,
            authority_add: true,
            authority_remove: true,
            filtered_protocols: false,
            protocols: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub version: Version,
    /// A prior session id makes this a resume attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessionid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkFilter>,
}

/// One cluster route: a node id and whether the node is certified.
/// Routes in a connect reply may carry the node's identities inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRoute {
    pub nodeid: String,
    #[serde(default)]
    pub certified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identities: Option<Vec<String>>,
}

/// A subscription entry as enumerated by the connect reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub protocol: String,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResult {
    #[serde(default)]
    pub session_restored: bool,
    pub sessionid: Uuid,
    pub nodeid: String,
    pub master_nodeid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Value>,
    #[serde(default)]
    pub routes: Vec<NodeRoute>,
    #[serde(default)]
    pub protocols: Vec<Protocol>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
    #[serde(default)]
    pub authorities: Vec<String>,
    #[serde(default)]
    pub protocols_uncertified: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resume_fields_are_omitted_when_absent() {
        let request = ConnectRequest {
            version: VERSION,
            sessionid: None,
            authentication: Some(json!({"project": "p", "token": "t"})),
            agent: Some("blade-client".into()),
            identity: None,
            network: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("sessionid").is_none());
        assert!(json.get("identity").is_none());
        assert_eq!(json["version"], json!({"major": 2, "minor": 0, "revision": 0}));
    }

    #[test]
    fn sparse_connect_replies_parse() {
        let sessionid = Uuid::new_v4();
        let reply: ConnectResult = serde_json::from_value(json!({
            "sessionid": sessionid,
            "nodeid": "node-1",
            "master_nodeid": "master-1",
        }))
        .unwrap();
        assert!(!reply.session_restored);
        assert!(reply.routes.is_empty());
        assert!(reply.protocols_uncertified.is_empty());
    }
}
