// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! The node store: an in-memory, concurrently-read mirror of the
//! cluster's routing/protocol/subscription state.
//!
//! The store is seeded from a `blade.connect` reply and kept current by
//! applying `blade.netcast` commands. Each collection has its own
//! reader-writer lock; observer callbacks are invoked after the write lock
//! has been released, so they may re-enter the store's read paths but must
//! not assume they still see the state that triggered them.

use crate::Error;
use blade_rpc::methods::connect::{ConnectResult, NodeRoute, SubscriptionEntry};
use blade_rpc::methods::netcast::{
    self, AuthorityParams, IdentityParams, NetcastRequest, ProtocolAddParams,
    ProtocolRemoveParams, ProviderAddParams, ProviderDataUpdateParams, ProviderRankUpdateParams,
    ProviderRemoveParams, SubscriptionParams,
};
use blade_rpc::methods::protocol::{Protocol, Provider};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

const LOG_TARGET: &str = "blade-store";

macro_rules! lock_read {
    ($lock:expr) => {
        $lock.read().expect("store lock")
    };
}

macro_rules! lock_write {
    ($lock:expr) => {
        $lock.write().expect("store lock")
    };
}

type Callback<T> = Option<Arc<dyn Fn(&T) + Send + Sync>>;
type NameCallback = Option<Arc<dyn Fn(&str) + Send + Sync>>;

/// Observers for individual store mutations. Invoked outside of write
/// locks; a callback must not mutate the store.
#[derive(Default)]
struct Callbacks {
    route_add: Callback<NodeRoute>,
    route_remove: Callback<NodeRoute>,
    identity_add: Callback<IdentityParams>,
    identity_remove: Callback<IdentityParams>,
    protocol_add: NameCallback,
    protocol_remove: NameCallback,
    provider_add: Callback<ProviderAddParams>,
    provider_remove: Callback<ProviderRemoveParams>,
    provider_rank_update: Callback<ProviderRankUpdateParams>,
    provider_data_update: Callback<ProviderDataUpdateParams>,
    authority_add: Callback<AuthorityParams>,
    authority_remove: Callback<AuthorityParams>,
    subscription_add: Callback<SubscriptionParams>,
    subscription_remove: Callback<SubscriptionParams>,
}

#[derive(Default)]
pub struct NodeStore {
    routes: RwLock<HashMap<String, NodeRoute>>,
    /// identity uri -> node id
    identities: RwLock<HashMap<String, String>>,
    protocols: RwLock<HashMap<String, Protocol>>,
    /// keyed by "protocol:channel"
    subscriptions: RwLock<HashMap<String, SubscriptionEntry>>,
    authorities: RwLock<HashSet<String>>,
    /// protocol names visible to uncertified clients only
    protocols_uncertified: RwLock<HashSet<String>>,
    callbacks: RwLock<Callbacks>,
}

fn subscription_key(protocol: &str, channel: &str) -> String {
    format!("{protocol}:{channel}")
}

impl NodeStore {
    pub fn new() -> NodeStore {
        NodeStore::default()
    }

    /// Drop all mirrored state. Registered callbacks survive a reset.
    pub fn reset(&self) {
        lock_write!(self.routes).clear();
        lock_write!(self.identities).clear();
        lock_write!(self.protocols).clear();
        lock_write!(self.subscriptions).clear();
        lock_write!(self.authorities).clear();
        lock_write!(self.protocols_uncertified).clear();
    }

    /// Seed the store from a connect reply. Each route's embedded
    /// identities are flattened into the identity map.
    pub fn populate(&self, reply: &ConnectResult) {
        {
            let mut routes = lock_write!(self.routes);
            let mut identities = lock_write!(self.identities);
            for route in &reply.routes {
                if let Some(route_identities) = &route.identities {
                    for identity in route_identities {
                        identities.insert(identity.clone(), route.nodeid.clone());
                    }
                }
                routes.insert(route.nodeid.clone(), route.clone());
            }
        }
        {
            let mut protocols = lock_write!(self.protocols);
            for protocol in &reply.protocols {
                protocols.insert(protocol.name.clone(), protocol.clone());
            }
        }
        {
            let mut subscriptions = lock_write!(self.subscriptions);
            for subscription in &reply.subscriptions {
                subscriptions.insert(
                    subscription_key(&subscription.protocol, &subscription.channel),
                    subscription.clone(),
                );
            }
        }
        {
            let mut authorities = lock_write!(self.authorities);
            for authority in &reply.authorities {
                authorities.insert(authority.clone());
            }
        }
        {
            let mut uncertified = lock_write!(self.protocols_uncertified);
            for name in &reply.protocols_uncertified {
                uncertified.insert(name.clone());
            }
        }
        tracing::debug!(
            target: LOG_TARGET,
            "populated node store: protocols {} routes {} authorities {} subscriptions {}",
            lock_read!(self.protocols).len(),
            lock_read!(self.routes).len(),
            lock_read!(self.authorities).len(),
            lock_read!(self.subscriptions).len(),
        );
    }

    // ---------------------------------------------------------------
    // Read queries
    // ---------------------------------------------------------------

    /// Whether the name is known, either as a full protocol or as an
    /// uncertified-only protocol name.
    pub fn check_protocol(&self, name: &str) -> bool {
        lock_read!(self.protocols).contains_key(name) || lock_read!(self.protocols_uncertified).contains(name)
    }

    /// Pick one provider of the protocol uniformly at random. `None` when
    /// the protocol is unknown or currently has no providers.
    pub fn select_random_protocol_provider(&self, name: &str) -> Option<String> {
        let protocols = lock_read!(self.protocols);
        let providers = &protocols.get(name)?.providers;
        if providers.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..providers.len());
        Some(providers[index].nodeid.clone())
    }

    /// All identity URIs mapping to the given node.
    pub fn get_node_identities(&self, nodeid: &str) -> Vec<String> {
        lock_read!(self.identities)
            .iter()
            .filter(|(_, mapped)| mapped.as_str() == nodeid)
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    /// A deep copy of the protocol's provider list.
    pub fn get_protocol_providers(&self, name: &str) -> Option<Vec<Provider>> {
        let protocols = lock_read!(self.protocols);
        let providers = &protocols.get(name)?.providers;
        if providers.is_empty() {
            return None;
        }
        Some(providers.clone())
    }

    /// The names of all fully-known protocols.
    pub fn get_protocols(&self) -> Vec<String> {
        lock_read!(self.protocols).keys().cloned().collect()
    }

    pub fn route_count(&self) -> usize {
        lock_read!(self.routes).len()
    }

    pub fn protocol_count(&self) -> usize {
        lock_read!(self.protocols).len()
    }

    pub fn identity_count(&self) -> usize {
        lock_read!(self.identities).len()
    }

    pub fn authority_count(&self) -> usize {
        lock_read!(self.authorities).len()
    }

    // ---------------------------------------------------------------
    // Netcast mutators
    // ---------------------------------------------------------------

    /// Apply one netcast command. Unknown commands are logged and
    /// ignored; they are not errors.
    pub fn update(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        match rqu.command.as_str() {
            netcast::CMD_PROTOCOL_ADD => self.update_protocol_add(rqu),
            netcast::CMD_PROTOCOL_REMOVE => self.update_protocol_remove(rqu),
            netcast::CMD_PROTOCOL_PROVIDER_ADD => self.update_provider_add(rqu),
            netcast::CMD_PROTOCOL_PROVIDER_REMOVE => self.update_provider_remove(rqu),
            netcast::CMD_PROTOCOL_PROVIDER_RANK_UPDATE => self.update_provider_rank(rqu),
            netcast::CMD_PROTOCOL_PROVIDER_DATA_UPDATE => self.update_provider_data(rqu),
            netcast::CMD_ROUTE_ADD => self.update_route_add(rqu),
            netcast::CMD_ROUTE_REMOVE => self.update_route_remove(rqu),
            netcast::CMD_IDENTITY_ADD => self.update_identity_add(rqu),
            netcast::CMD_IDENTITY_REMOVE => self.update_identity_remove(rqu),
            netcast::CMD_SUBSCRIPTION_ADD => self.update_subscription(rqu, true),
            netcast::CMD_SUBSCRIPTION_REMOVE => self.update_subscription(rqu, false),
            netcast::CMD_AUTHORITY_ADD => self.update_authority_add(rqu),
            netcast::CMD_AUTHORITY_REMOVE => self.update_authority_remove(rqu),
            // Reserved for future use; accepted and ignored.
            netcast::CMD_AUTHORIZATION_ADD
            | netcast::CMD_AUTHORIZATION_UPDATE
            | netcast::CMD_AUTHORIZATION_REMOVE
            | netcast::CMD_ACCESS_ADD
            | netcast::CMD_ACCESS_REMOVE => Ok(()),
            other => {
                tracing::warn!(target: LOG_TARGET, "unknown netcast subcommand: {other}");
                Ok(())
            }
        }
    }

    // Protocol add/remove apply to uncertified-only protocol names.
    fn update_protocol_add(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: ProtocolAddParams = rqu.params()?;
        let added = lock_write!(self.protocols_uncertified).insert(params.protocol.clone());
        if added {
            tracing::info!(target: LOG_TARGET, "protocol {} added", params.protocol);
            self.fire_protocol_add(&params.protocol);
        }
        Ok(())
    }

    fn update_protocol_remove(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: ProtocolRemoveParams = rqu.params()?;
        let removed = lock_write!(self.protocols_uncertified).remove(&params.protocol);
        if removed {
            self.fire_protocol_remove(&params.protocol);
        }
        Ok(())
    }

    fn update_provider_add(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: ProviderAddParams = rqu.params()?;
        let provider = Provider {
            nodeid: params.nodeid.clone(),
            identities: None,
            rank: params.rank,
            data: params.data.clone(),
        };

        let created = {
            let mut protocols = lock_write!(self.protocols);
            match protocols.get_mut(&params.protocol) {
                Some(protocol) => {
                    protocol.providers.push(provider);
                    tracing::info!(
                        target: LOG_TARGET,
                        "protocol {} add complete, provider count {}",
                        params.protocol,
                        protocol.providers.len()
                    );
                    false
                }
                None => {
                    tracing::info!(
                        target: LOG_TARGET,
                        "protocol {} does not exist yet, adding new entry",
                        params.protocol
                    );
                    protocols.insert(
                        params.protocol.clone(),
                        Protocol {
                            name: params.protocol.clone(),
                            default_method_execute_access: params.default_method_execute_access,
                            default_channel_broadcast_access: params
                                .default_channel_broadcast_access,
                            default_channel_subscribe_access: params
                                .default_channel_subscribe_access,
                            providers: vec![provider],
                            channels: params.channels.clone().unwrap_or_default(),
                        },
                    );
                    true
                }
            }
        };

        if created {
            self.fire_protocol_add(&params.protocol);
        }
        if let Some(cb) = lock_read!(self.callbacks).provider_add.clone() {
            cb(&params);
        }
        Ok(())
    }

    fn update_provider_remove(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: ProviderRemoveParams = rqu.params()?;

        let (matched, emptied) = {
            let mut protocols = lock_write!(self.protocols);
            let Some(protocol) = protocols.get_mut(&params.protocol) else {
                tracing::warn!(
                    target: LOG_TARGET,
                    "received provider remove for protocol '{}' which does not exist",
                    params.protocol
                );
                return Ok(());
            };
            let before = protocol.providers.len();
            protocol.providers.retain(|p| p.nodeid != params.nodeid);
            let matched = protocol.providers.len() != before;
            let emptied = matched && protocol.providers.is_empty();
            if emptied {
                protocols.remove(&params.protocol);
            }
            (matched, emptied)
        };

        if emptied {
            tracing::info!(
                target: LOG_TARGET,
                "no more providers present in protocol {}, removing",
                params.protocol
            );
            self.fire_protocol_remove(&params.protocol);
        }
        if matched {
            if let Some(cb) = lock_read!(self.callbacks).provider_remove.clone() {
                cb(&params);
            }
        }
        Ok(())
    }

    fn update_provider_rank(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: ProviderRankUpdateParams = rqu.params()?;
        let found = {
            let mut protocols = lock_write!(self.protocols);
            match protocols.get_mut(&params.protocol) {
                None => false,
                Some(protocol) => {
                    let mut found = false;
                    for provider in &mut protocol.providers {
                        if provider.nodeid == params.nodeid {
                            provider.rank = params.rank;
                            found = true;
                        }
                    }
                    found
                }
            }
        };
        if found {
            if let Some(cb) = lock_read!(self.callbacks).provider_rank_update.clone() {
                cb(&params);
            }
        }
        Ok(())
    }

    fn update_provider_data(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: ProviderDataUpdateParams = rqu.params()?;
        let found = {
            let mut protocols = lock_write!(self.protocols);
            match protocols.get_mut(&params.protocol) {
                None => false,
                Some(protocol) => {
                    let mut found = false;
                    for provider in &mut protocol.providers {
                        if provider.nodeid == params.nodeid {
                            provider.data = params.data.clone();
                            found = true;
                        }
                    }
                    found
                }
            }
        };
        if found {
            if let Some(cb) = lock_read!(self.callbacks).provider_data_update.clone() {
                cb(&params);
            }
        }
        Ok(())
    }

    fn update_route_add(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let route: NodeRoute = rqu.params()?;
        lock_write!(self.routes).insert(route.nodeid.clone(), route.clone());
        if let Some(cb) = lock_read!(self.callbacks).route_add.clone() {
            cb(&route);
        }
        Ok(())
    }

    /// Removing a route cascades: the node's identities go, the node is
    /// dropped from every protocol's provider list (removing protocols
    /// that empty out), and its authority entry goes too.
    fn update_route_remove(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let route: NodeRoute = rqu.params()?;

        if let Some(cb) = lock_read!(self.callbacks).route_remove.clone() {
            cb(&route);
        }

        lock_write!(self.routes).remove(&route.nodeid);

        {
            let mut identities = lock_write!(self.identities);
            identities.retain(|identity, mapped| {
                if mapped.as_str() == route.nodeid {
                    tracing::info!(
                        target: LOG_TARGET,
                        "removing identity {identity} from node {}",
                        route.nodeid
                    );
                    false
                } else {
                    true
                }
            });
        }

        for name in self.remove_provider_from_protocols(&route.nodeid) {
            self.fire_protocol_remove(&name);
        }

        lock_write!(self.authorities).remove(&route.nodeid);
        Ok(())
    }

    /// Drop the node from every protocol's provider list, removing
    /// protocols that end up with no providers. Returns the names of the
    /// removed protocols.
    fn remove_provider_from_protocols(&self, nodeid: &str) -> Vec<String> {
        let mut protocols = lock_write!(self.protocols);
        let mut emptied = Vec::new();
        for (name, protocol) in protocols.iter_mut() {
            let before = protocol.providers.len();
            protocol.providers.retain(|p| p.nodeid != nodeid);
            if protocol.providers.len() != before {
                tracing::info!(
                    target: LOG_TARGET,
                    "removing provider {nodeid} from protocol {name}"
                );
                if protocol.providers.is_empty() {
                    emptied.push(name.clone());
                }
            }
        }
        for name in &emptied {
            protocols.remove(name);
        }
        emptied
    }

    fn update_identity_add(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: IdentityParams = rqu.params()?;
        lock_write!(self.identities).insert(params.identity.clone(), params.nodeid.clone());
        if let Some(cb) = lock_read!(self.callbacks).identity_add.clone() {
            cb(&params);
        }
        Ok(())
    }

    fn update_identity_remove(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: IdentityParams = rqu.params()?;
        let removed = {
            let mut identities = lock_write!(self.identities);
            // Only remove when the identity still maps to the named node.
            match identities.get(&params.identity) {
                Some(mapped) if mapped.as_str() == params.nodeid => {
                    identities.remove(&params.identity);
                    true
                }
                _ => false,
            }
        };
        if removed {
            if let Some(cb) = lock_read!(self.callbacks).identity_remove.clone() {
                cb(&params);
            }
        }
        Ok(())
    }

    // The store does not track per-subscription channels beyond the
    // seeded entries; subscription netcasts are callbacks-only.
    fn update_subscription(&self, rqu: &NetcastRequest, add: bool) -> Result<(), Error> {
        let params: SubscriptionParams = rqu.params()?;
        let cb = {
            let callbacks = lock_read!(self.callbacks);
            if add {
                callbacks.subscription_add.clone()
            } else {
                callbacks.subscription_remove.clone()
            }
        };
        if let Some(cb) = cb {
            cb(&params);
        }
        Ok(())
    }

    fn update_authority_add(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: AuthorityParams = rqu.params()?;
        lock_write!(self.authorities).insert(params.nodeid.clone());
        if let Some(cb) = lock_read!(self.callbacks).authority_add.clone() {
            cb(&params);
        }
        Ok(())
    }

    fn update_authority_remove(&self, rqu: &NetcastRequest) -> Result<(), Error> {
        let params: AuthorityParams = rqu.params()?;
        lock_write!(self.authorities).remove(&params.nodeid);
        if let Some(cb) = lock_read!(self.callbacks).authority_remove.clone() {
            cb(&params);
        }
        Ok(())
    }

    fn fire_protocol_add(&self, name: &str) {
        if let Some(cb) = lock_read!(self.callbacks).protocol_add.clone() {
            cb(name);
        }
    }

    fn fire_protocol_remove(&self, name: &str) {
        if let Some(cb) = lock_read!(self.callbacks).protocol_remove.clone() {
            cb(name);
        }
    }

    // ---------------------------------------------------------------
    // Observer registration
    // ---------------------------------------------------------------

    pub fn on_route_add(&self, cb: impl Fn(&NodeRoute) + Send + Sync + 'static) {
        lock_write!(self.callbacks).route_add = Some(Arc::new(cb));
    }

    pub fn on_route_remove(&self, cb: impl Fn(&NodeRoute) + Send + Sync + 'static) {
        lock_write!(self.callbacks).route_remove = Some(Arc::new(cb));
    }

    pub fn on_identity_add(&self, cb: impl Fn(&IdentityParams) + Send + Sync + 'static) {
        lock_write!(self.callbacks).identity_add = Some(Arc::new(cb));
    }

    pub fn on_identity_remove(&self, cb: impl Fn(&IdentityParams) + Send + Sync + 'static) {
        lock_write!(self.callbacks).identity_remove = Some(Arc::new(cb));
    }

    pub fn on_protocol_add(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        lock_write!(self.callbacks).protocol_add = Some(Arc::new(cb));
    }

    pub fn on_protocol_remove(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        lock_write!(self.callbacks).protocol_remove = Some(Arc::new(cb));
    }

    pub fn on_provider_add(&self, cb: impl Fn(&ProviderAddParams) + Send + Sync + 'static) {
        lock_write!(self.callbacks).provider_add = Some(Arc::new(cb));
    }

    pub fn on_provider_remove(&self, cb: impl Fn(&ProviderRemoveParams) + Send + Sync + 'static) {
        lock_write!(self.callbacks).provider_remove = Some(Arc::new(cb));
    }

    pub fn on_provider_rank_update(
        &self,
        cb: impl Fn(&ProviderRankUpdateParams) + Send + Sync + 'static,
    ) {
        lock_write!(self.callbacks).provider_rank_update = Some(Arc::new(cb));
    }

    pub fn on_provider_data_update(
        &self,
        cb: impl Fn(&ProviderDataUpdateParams) + Send + Sync + 'static,
    ) {
        lock_write!(self.callbacks).provider_data_update = Some(Arc::new(cb));
    }

    pub fn on_authority_add(&self, cb: impl Fn(&AuthorityParams) + Send + Sync + 'static) {
        lock_write!(self.callbacks).authority_add = Some(Arc::new(cb));
    }

    pub fn on_authority_remove(&self, cb: impl Fn(&AuthorityParams) + Send + Sync + 'static) {
        lock_write!(self.callbacks).authority_remove = Some(Arc::new(cb));
    }

    pub fn on_subscription_add(&self, cb: impl Fn(&SubscriptionParams) + Send + Sync + 'static) {
        lock_write!(self.callbacks).subscription_add = Some(Arc::new(cb));
    }

    pub fn on_subscription_remove(&self, cb: impl Fn(&SubscriptionParams) + Send + Sync + 'static) {
        lock_write!(self.callbacks).subscription_remove = Some(Arc::new(cb));
    }
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("protocols", &self.protocol_count())
            .field("routes", &self.route_count())
            .field("authorities", &self.authority_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blade_rpc::methods::protocol::{AccessControl, Channel};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn netcast(command: &str, params: serde_json::Value) -> NetcastRequest {
        NetcastRequest {
            command: command.into(),
            certified_only: true,
            netcaster_nodeid: "netcaster".into(),
            params,
        }
    }

    fn provider_add(protocol: &str, nodeid: &str, channel: &str) -> NetcastRequest {
        netcast(
            netcast::CMD_PROTOCOL_PROVIDER_ADD,
            json!({
                "protocol": protocol,
                "nodeid": nodeid,
                "channels": [{"name": channel, "broadcast_access": 1, "subscribe_access": 1}],
            }),
        )
    }

    fn seeded_store() -> NodeStore {
        let store = NodeStore::new();
        let reply: ConnectResult = serde_json::from_value(json!({
            "session_restored": false,
            "sessionid": uuid::Uuid::new_v4(),
            "nodeid": "node-a",
            "master_nodeid": "master",
            "routes": [
                {"nodeid": "node-a", "certified": true, "identities": ["sip:alice@example.com"]},
                {"nodeid": "node-b", "certified": true},
            ],
            "protocols": [
                {
                    "name": "proto_one",
                    "default_method_execute_access": 1,
                    "default_channel_broadcast_access": 1,
                    "default_channel_subscribe_access": 1,
                    "providers": [{"nodeid": "node-a", "rank": 1}],
                    "channels": [{"name": "events", "broadcast_access": 1, "subscribe_access": 1}],
                },
                {
                    "name": "proto_two",
                    "default_method_execute_access": 1,
                    "default_channel_broadcast_access": 1,
                    "default_channel_subscribe_access": 1,
                    "providers": [{"nodeid": "node-b", "rank": 1}],
                    "channels": [],
                },
            ],
            "subscriptions": [
                {"protocol": "proto_one", "channel": "events"},
            ],
            "authorities": ["node-a"],
        }))
        .unwrap();
        store.populate(&reply);
        store
    }

    #[test]
    fn seeding_flattens_route_identities() {
        let store = seeded_store();
        assert_eq!(store.route_count(), 2);
        assert_eq!(store.protocol_count(), 2);
        assert_eq!(
            store.get_node_identities("node-a"),
            vec!["sip:alice@example.com".to_string()]
        );
        assert!(store.check_protocol("proto_one"));
        assert!(!store.check_protocol("proto_unknown"));
    }

    #[test]
    fn provider_add_then_route_remove_restores_protocol_count() {
        let store = seeded_store();

        store
            .update(&provider_add("bobo_protocol_new", "node-new", "bobo_channel_new"))
            .unwrap();
        assert_eq!(store.protocol_count(), 3);
        let providers = store.get_protocol_providers("bobo_protocol_new").unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].nodeid, "node-new");

        store
            .update(&netcast(
                netcast::CMD_ROUTE_REMOVE,
                json!({"nodeid": "node-new"}),
            ))
            .unwrap();
        assert_eq!(store.protocol_count(), 2);
        assert!(!store.check_protocol("bobo_protocol_new"));
    }

    #[test]
    fn route_remove_cascades_identities_providers_and_authorities() {
        let store = seeded_store();
        let removed_protocols = Arc::new(AtomicUsize::new(0));
        let counter = removed_protocols.clone();
        store.on_protocol_remove(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store
            .update(&netcast(
                netcast::CMD_ROUTE_REMOVE,
                json!({"nodeid": "node-a"}),
            ))
            .unwrap();

        assert_eq!(store.route_count(), 1);
        assert!(store.get_node_identities("node-a").is_empty());
        assert_eq!(store.identity_count(), 0);
        // proto_one lost its only provider and went away with it
        assert!(!store.check_protocol("proto_one"));
        assert_eq!(removed_protocols.load(Ordering::SeqCst), 1);
        assert_eq!(store.authority_count(), 0);
    }

    #[test]
    fn provider_add_on_unknown_protocol_creates_it_and_fires_protocol_add() {
        let store = NodeStore::new();
        let added = Arc::new(AtomicUsize::new(0));
        let counter = added.clone();
        store.on_protocol_add(move |name| {
            assert_eq!(name, "fresh");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.update(&provider_add("fresh", "node-x", "chan")).unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 1);

        // A second provider joins the existing protocol without another
        // protocol-add event.
        store.update(&provider_add("fresh", "node-y", "chan")).unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_protocol_providers("fresh").unwrap().len(), 2);
    }

    #[test]
    fn provider_remove_that_empties_a_protocol_removes_it() {
        let store = seeded_store();
        store
            .update(&netcast(
                netcast::CMD_PROTOCOL_PROVIDER_REMOVE,
                json!({"protocol": "proto_two", "nodeid": "node-b"}),
            ))
            .unwrap();
        assert!(!store.check_protocol("proto_two"));
        assert_eq!(store.protocol_count(), 1);
    }

    #[test]
    fn rank_and_data_updates_mutate_in_place() {
        let store = seeded_store();
        store
            .update(&netcast(
                netcast::CMD_PROTOCOL_PROVIDER_RANK_UPDATE,
                json!({"protocol": "proto_one", "nodeid": "node-a", "rank": 9}),
            ))
            .unwrap();
        store
            .update(&netcast(
                netcast::CMD_PROTOCOL_PROVIDER_DATA_UPDATE,
                json!({"protocol": "proto_one", "nodeid": "node-a", "data": {"load": 0.5}}),
            ))
            .unwrap();

        let providers = store.get_protocol_providers("proto_one").unwrap();
        assert_eq!(providers[0].rank, 9);
        assert_eq!(providers[0].data, Some(json!({"load": 0.5})));
    }

    #[test]
    fn identity_remove_verifies_the_mapping() {
        let store = seeded_store();
        // Wrong node: the identity stays.
        store
            .update(&netcast(
                netcast::CMD_IDENTITY_REMOVE,
                json!({"nodeid": "node-b", "identity": "sip:alice@example.com"}),
            ))
            .unwrap();
        assert_eq!(store.identity_count(), 1);

        store
            .update(&netcast(
                netcast::CMD_IDENTITY_REMOVE,
                json!({"nodeid": "node-a", "identity": "sip:alice@example.com"}),
            ))
            .unwrap();
        assert_eq!(store.identity_count(), 0);
    }

    #[test]
    fn uncertified_protocol_names_satisfy_check_protocol() {
        let store = NodeStore::new();
        store
            .update(&netcast(
                netcast::CMD_PROTOCOL_ADD,
                json!({"protocol": "uncert_proto"}),
            ))
            .unwrap();
        assert!(store.check_protocol("uncert_proto"));
        // But it has no providers to select from.
        assert_eq!(store.select_random_protocol_provider("uncert_proto"), None);

        store
            .update(&netcast(
                netcast::CMD_PROTOCOL_REMOVE,
                json!({"protocol": "uncert_proto"}),
            ))
            .unwrap();
        assert!(!store.check_protocol("uncert_proto"));
    }

    #[test]
    fn random_provider_selection_handles_the_empty_case() {
        let store = seeded_store();
        assert_eq!(store.select_random_protocol_provider("missing"), None);
        let picked = store.select_random_protocol_provider("proto_one").unwrap();
        assert_eq!(picked, "node-a");
    }

    #[test]
    fn unknown_and_reserved_netcasts_are_tolerated() {
        let store = seeded_store();
        store
            .update(&netcast("authorization.add", json!({"whatever": 1})))
            .unwrap();
        store
            .update(&netcast("something.future", json!({})))
            .unwrap();
        assert_eq!(store.protocol_count(), 2);
    }

    #[test]
    fn reset_clears_state_but_keeps_callbacks() {
        let store = seeded_store();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        store.on_protocol_add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.reset();
        assert_eq!(store.route_count(), 0);
        assert_eq!(store.protocol_count(), 0);

        store.update(&provider_add("back", "node-z", "chan")).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channels_survive_into_created_protocols() {
        let store = NodeStore::new();
        store.update(&provider_add("p", "n", "the_channel")).unwrap();
        let protocols = store.get_protocols();
        assert_eq!(protocols, vec!["p".to_string()]);

        // Check the created channel through a fresh populate round-trip.
        let expected = Channel {
            name: "the_channel".into(),
            broadcast_access: AccessControl::Public,
            subscribe_access: AccessControl::Public,
        };
        let providers = store.get_protocol_providers("p").unwrap();
        assert_eq!(providers[0].rank, 1);
        drop(providers);
        // The channel list was copied from the netcast params.
        let stored = lock_read!(store.protocols);
        assert_eq!(stored.get("p").unwrap().channels, vec![expected]);
    }
}
