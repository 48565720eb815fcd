// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! Session configuration: credentials, informational strings and the
//! upstream network filter. Values come from explicit setters, a JSON
//! blob, or `SW_*` environment variables.

use crate::Error;
use blade_rpc::methods::NetworkFilter;
use serde_json::Value;
use std::path::PathBuf;

const LOG_TARGET: &str = "blade-config";

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// TLS mutual-auth materials; certified clients set all three.
    pub private_key_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub cert_chain_path: Option<PathBuf>,
    /// Opaque authentication JSON, passed through to `blade.connect`.
    /// Required when no certificates are configured.
    pub authentication: Option<String>,
    pub agent: Option<String>,
    pub identity: Option<String>,
    network: Option<NetworkFilter>,
}

fn env_flag(value: &str) -> bool {
    matches!(value.chars().next(), Some('1' | 't' | 'T'))
}

impl Config {
    /// The effective network filter: the configured one, or everything-on.
    pub fn network(&self) -> NetworkFilter {
        self.network.clone().unwrap_or_default()
    }

    pub fn set_network(&mut self, network: NetworkFilter) {
        self.network = Some(network);
    }

    /// Whether a connect can be attempted at all: either certificate
    /// materials or an authentication blob must be present.
    pub fn has_authentication(&self) -> bool {
        (self.private_key_path.is_some() && self.client_cert_path.is_some())
            || self.authentication.is_some()
    }

    /// The authentication blob parsed as JSON, when configured.
    pub fn authentication_json(&self) -> Result<Option<Value>, Error> {
        match &self.authentication {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(raw).map_err(|e| {
                Error::Config(format!("authentication is not valid JSON: {e}"))
            })?)),
        }
    }

    /// Merge settings from a JSON blob. Recognized keys mirror the
    /// environment variables; unknown keys are ignored.
    pub fn load_from_json(&mut self, json: &Value) {
        let get = |key: &str| json.get(key).and_then(Value::as_str);
        if let Some(val) = get("private_key_path") {
            self.private_key_path = Some(PathBuf::from(val));
        }
        if let Some(val) = get("client_cert_path") {
            self.client_cert_path = Some(PathBuf::from(val));
        }
        if let Some(val) = get("cert_chain_path") {
            self.cert_chain_path = Some(PathBuf::from(val));
        }
        if let Some(val) = get("authentication") {
            self.authentication = Some(val.to_owned());
        }
        if let Some(val) = get("agent") {
            self.agent = Some(val.to_owned());
        }
        if let Some(val) = get("identity") {
            self.identity = Some(val.to_owned());
        }
        if let Some(network) = json.get("network") {
            match serde_json::from_value(network.clone()) {
                Ok(network) => self.network = Some(network),
                Err(e) => {
                    tracing::warn!(target: LOG_TARGET, "ignoring malformed network config: {e}");
                }
            }
        }
    }

    /// Merge settings from `SW_*` environment variables.
    pub fn load_from_env(&mut self) {
        let get = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(val) = get("SW_PRIVATE_KEY_PATH") {
            self.private_key_path = Some(PathBuf::from(val));
        }
        if let Some(val) = get("SW_CLIENT_CERT_PATH") {
            self.client_cert_path = Some(PathBuf::from(val));
        }
        if let Some(val) = get("SW_CERT_CHAIN_PATH") {
            self.cert_chain_path = Some(PathBuf::from(val));
        }
        if let Some(val) = get("SW_AUTHENTICATION") {
            self.authentication = Some(val);
        }
        if let Some(val) = get("SW_AGENT") {
            self.agent = Some(val);
        }
        if let Some(val) = get("SW_IDENTITY") {
            self.identity = Some(val);
        }

        let mut network = self.network.clone().unwrap_or_default();
        let mut touched = self.network.is_some();
        let flag = |name: &str, slot: &mut bool, touched: &mut bool| {
            if let Some(val) = get(name) {
                *slot = env_flag(&val);
                *touched = true;
            }
        };
        flag("SW_NETWORK_ROUTE_DATA", &mut network.route_data, &mut touched);
        flag("SW_NETWORK_ROUTE_ADD", &mut network.route_add, &mut touched);
        flag("SW_NETWORK_ROUTE_REMOVE", &mut network.route_remove, &mut touched);
        flag("SW_NETWORK_AUTHORITY_DATA", &mut network.authority_data, &mut touched);
        flag("SW_NETWORK_AUTHORITY_ADD", &mut network.authority_add, &mut touched);
        flag("SW_NETWORK_AUTHORITY_REMOVE", &mut network.authority_remove, &mut touched);
        flag(
            "SW_NETWORK_FILTERED_PROTOCOLS",
            &mut network.filtered_protocols,
            &mut touched,
        );

        // 0-based, stops at the first missing index.
        let mut protocols = Vec::new();
        for index in 0.. {
            match get(&format!("SW_NETWORK_PROTOCOL_{index}")) {
                Some(val) => protocols.push(val),
                None => break,
            }
        }
        if !protocols.is_empty() {
            network.protocols = Some(protocols);
            touched = true;
        }

        if touched {
            self.network = Some(network);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_blob_populates_credentials() {
        let mut config = Config::default();
        config.load_from_json(&json!({
            "private_key_path": "/etc/blade/key.pem",
            "client_cert_path": "/etc/blade/cert.pem",
            "cert_chain_path": "/etc/blade/chain.pem",
            "agent": "test-agent",
        }));
        assert_eq!(
            config.private_key_path.as_deref(),
            Some(std::path::Path::new("/etc/blade/key.pem"))
        );
        assert!(config.has_authentication());
        assert_eq!(config.agent.as_deref(), Some("test-agent"));
        // No network configured: the effective filter is everything-on.
        assert!(config.network().route_data);
        assert!(!config.network().filtered_protocols);
    }

    #[test]
    fn authentication_alone_satisfies_has_authentication() {
        let mut config = Config::default();
        assert!(!config.has_authentication());
        config.authentication = Some(r#"{"project":"p","token":"t"}"#.into());
        assert!(config.has_authentication());
        let json = config.authentication_json().unwrap().unwrap();
        assert_eq!(json["project"], "p");

        config.authentication = Some("not json".into());
        assert!(config.authentication_json().is_err());
    }

    // All environment manipulation lives in one test; the process
    // environment is shared across test threads.
    #[test]
    fn environment_populates_config_and_protocol_list_stops_at_gap() {
        unsafe {
            std::env::set_var("SW_AUTHENTICATION", r#"{"token":"t"}"#);
            std::env::set_var("SW_AGENT", "env-agent");
            std::env::set_var("SW_NETWORK_ROUTE_DATA", "false");
            std::env::set_var("SW_NETWORK_FILTERED_PROTOCOLS", "true");
            std::env::set_var("SW_NETWORK_PROTOCOL_0", "proto_a");
            std::env::set_var("SW_NETWORK_PROTOCOL_1", "proto_b");
            // index 2 missing; index 3 must not be picked up
            std::env::set_var("SW_NETWORK_PROTOCOL_3", "proto_d");
        }

        let mut config = Config::default();
        config.load_from_env();

        assert_eq!(config.agent.as_deref(), Some("env-agent"));
        let network = config.network();
        assert!(!network.route_data);
        assert!(network.route_add);
        assert!(network.filtered_protocols);
        assert_eq!(
            network.protocols,
            Some(vec!["proto_a".to_string(), "proto_b".to_string()])
        );

        unsafe {
            for name in [
                "SW_AUTHENTICATION",
                "SW_AGENT",
                "SW_NETWORK_ROUTE_DATA",
                "SW_NETWORK_FILTERED_PROTOCOLS",
                "SW_NETWORK_PROTOCOL_0",
                "SW_NETWORK_PROTOCOL_1",
                "SW_NETWORK_PROTOCOL_3",
            ] {
                std::env::remove_var(name);
            }
        }
    }
}
