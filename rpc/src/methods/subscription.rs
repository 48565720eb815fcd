// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! `blade.subscription`: register or drop interest in protocol channels.

use serde::{Deserialize, Serialize};

pub const SUBSCRIPTION_METHOD: &str = "blade.subscription";

pub const CMD_ADD: &str = "add";
pub const CMD_REMOVE: &str = "remove";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub command: String,
    pub protocol: String,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Channels the upstream refused to subscribe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_channels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_channels: Option<Vec<String>>,
}
