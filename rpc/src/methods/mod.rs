// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! Wire types for every Blade method the client speaks, one module per
//! message family. Each record derives its serde codec; request builders
//! live on the records themselves where the shape warrants it.

pub mod broadcast;
pub mod connect;
pub mod disconnect;
pub mod execute;
pub mod identity;
pub mod netcast;
pub mod ping;
pub mod protocol;
pub mod subscription;

pub use connect::{ConnectRequest, ConnectResult, NetworkFilter, NodeRoute, Version};
pub use protocol::{AccessControl, Channel, Protocol, Provider};
