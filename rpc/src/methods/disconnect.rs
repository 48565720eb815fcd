// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! `blade.disconnect`: the upstream announces it is about to drop the
//! socket. The client replies with an empty result and keeps reading until
//! the close actually happens.

use serde::{Deserialize, Serialize};

pub const DISCONNECT_METHOD: &str = "blade.disconnect";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectRequest {}
