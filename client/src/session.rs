// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! The session layer: reconnect/resume, inbound dispatch, result replay,
//! the metric scheduler and the high-level RPC helpers.
//!
//! A session owns at most one [`Connection`] at a time and replaces it
//! wholesale on reconnect. A monitor task ticks once a second, honoring
//! the connect/disconnect deadlines and driving the metric scheduler; a
//! transport failure schedules an automatic reconnect five seconds out,
//! and a failed connect retries every two seconds indefinitely.

use crate::config::Config;
use crate::store::NodeStore;
use crate::Error;
use blade_rpc::command::{Command, CommandFlags, Reply, ResponseFuture};
use blade_rpc::connection::{ConnectParams, Connection, ConnectionHooks, ConnectionTarget};
use blade_rpc::methods::broadcast::{BroadcastRequest, BROADCAST_METHOD};
use blade_rpc::methods::disconnect::DISCONNECT_METHOD;
use blade_rpc::methods::execute::{
    ExecuteError, ExecuteRequest, ExecuteResult, ERR_HANDLER_FAILED, ERR_METHOD_NOT_FOUND,
    ERR_NO_RESULT_SET, EXECUTE_METHOD,
};
use blade_rpc::methods::identity::{IdentityRequest, CMD_ADD as IDENTITY_CMD_ADD, IDENTITY_METHOD};
use blade_rpc::methods::netcast::{NetcastRequest, NETCAST_METHOD};
use blade_rpc::methods::ping::{PingRequest, PingResult, PING_METHOD};
use blade_rpc::methods::protocol::{
    AccessControl, Channel, ProtocolRequest, ProviderAddParams as ProtocolProviderAddParams,
    ProviderRankUpdateParams, CMD_PROVIDER_ADD, CMD_PROVIDER_RANK_UPDATE, CMD_PROVIDER_REMOVE,
    PROTOCOL_METHOD,
};
use blade_rpc::methods::subscription::{
    SubscriptionRequest, CMD_ADD as SUBSCRIPTION_CMD_ADD,
    CMD_REMOVE as SUBSCRIPTION_CMD_REMOVE, SUBSCRIPTION_METHOD,
};
use blade_rpc::tls::{client_config, TlsMaterial};
use blade_rpc::DEFAULT_PORT;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

const LOG_TARGET: &str = "blade-session";

/// The upstream JSON-RPC error code for rejected credentials.
const AUTH_FAILED_CODE: i64 = -32002;

/// Monitor cadence.
const MONITOR_TICK: Duration = Duration::from_secs(1);

/// Delay before retrying a failed connect.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Delay before reconnecting after a transport failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Transport-level connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a queued result survives while waiting for a reconnect.
const RESULT_REPLAY_TTL: Duration = Duration::from_secs(5);

/// `signalwire.setup` polls the node store this many times, this far
/// apart, for the new protocol to become visible.
const SETUP_POLL_ATTEMPTS: u32 = 20;
const SETUP_POLL_DELAY: Duration = Duration::from_millis(100);

/// Where the session currently is. `Restored` means the upstream resumed
/// our previous logical session across a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Offline,
    Online,
    Restored,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Online | SessionState::Restored)
    }
}

/// Callback for broadcasts on a subscribed (protocol, channel) pair.
pub type BroadcastHandler = Arc<dyn Fn(&BroadcastRequest) + Send + Sync>;

/// Handler for inbound `blade.execute` requests. The handler must set a
/// result or an error on the command; the session replies with it.
pub type MethodHandler =
    Arc<dyn Fn(&ExecuteRequest, &mut Command) -> Result<(), Error> + Send + Sync>;

/// Observer for session state transitions, serialized by the monitor.
pub type StateChangeHandler = Arc<dyn Fn(SessionState) + Send + Sync>;

/// Invoked when a connect is rejected with the auth-failed error code.
pub type AuthFailedHandler = Arc<dyn Fn() + Send + Sync>;

/// Everything a provider advertises besides the protocol name.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub method_execute_access: AccessControl,
    pub channel_subscribe_access: AccessControl,
    pub channel_broadcast_access: AccessControl,
    pub methods: Option<Vec<String>>,
    pub channels: Option<Vec<Channel>>,
    pub rank: i32,
    pub data: Option<Value>,
}

impl Default for ProviderSpec {
    fn default() -> Self {
        ProviderSpec {
            method_execute_access: AccessControl::System,
            channel_subscribe_access: AccessControl::System,
            channel_broadcast_access: AccessControl::System,
            methods: None,
            channels: None,
            rank: 1,
            data: None,
        }
    }
}

struct MetricEntry {
    interval: Duration,
    next_fire: Instant,
    rank: i32,
    dirty: bool,
}

struct QueuedResult {
    cmd: Command,
    expires_at: Instant,
}

#[derive(Default)]
struct SessionInfo {
    state: SessionState,
    sessionid: Option<Uuid>,
    nodeid: Option<String>,
    master_nodeid: Option<String>,
}

#[derive(Default)]
struct Deadlines {
    connect_at: Option<Instant>,
    disconnect_at: Option<Instant>,
}

struct SessionInner {
    target: Mutex<Url>,
    config: Mutex<Config>,
    store: Arc<NodeStore>,
    conn: tokio::sync::RwLock<Option<Arc<Connection>>>,
    info: RwLock<SessionInfo>,
    deadlines: Mutex<Deadlines>,
    monitor_wake: Arc<Notify>,
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// "protocol:method" -> handler
    methods: RwLock<HashMap<String, MethodHandler>>,
    /// "protocol:channel" -> handler
    subscriptions: RwLock<HashMap<String, BroadcastHandler>>,
    /// service -> protocol, recorded by `signalwire.setup`
    setups: RwLock<HashMap<String, String>>,
    metrics: RwLock<HashMap<String, MetricEntry>>,
    replay: Mutex<VecDeque<QueuedResult>>,
    on_state_change: Mutex<Option<StateChangeHandler>>,
    on_auth_failed: Mutex<Option<AuthFailedHandler>>,
}

fn subscription_key(protocol: &str, channel: &str) -> String {
    format!("{protocol}:{channel}")
}

fn pmethod_key(protocol: &str, method: &str) -> String {
    format!("{protocol}:{method}")
}

/// A long-lived logical connection to a Blade cluster node. Cheap to
/// clone; all clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create an offline session aimed at the given target URI. Use a
    /// `ws://` scheme to connect without TLS (tests, local brokers);
    /// anything else negotiates TLS from the configured materials.
    ///
    /// Nothing happens until [`Session::connect`] is called.
    pub fn new(target: &str, config: Config) -> Result<Session, Error> {
        let target = Url::parse(target)?;
        if target.host_str().is_none() {
            return Err(Error::Config(format!("target uri '{target}' has no host")));
        }
        tracing::info!(target: LOG_TARGET, "session created with target: {target}");

        if !config.has_authentication() {
            tracing::warn!(target: LOG_TARGET, "no authentication configured");
        }

        let inner = Arc::new(SessionInner {
            target: Mutex::new(target),
            config: Mutex::new(config),
            store: Arc::new(NodeStore::new()),
            conn: tokio::sync::RwLock::new(None),
            info: RwLock::new(SessionInfo::default()),
            deadlines: Mutex::new(Deadlines::default()),
            monitor_wake: Arc::new(Notify::new()),
            monitor: Mutex::new(None),
            methods: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            setups: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            replay: Mutex::new(VecDeque::new()),
            on_state_change: Mutex::new(None),
            on_auth_failed: Mutex::new(None),
        });

        let monitor = tokio::spawn(monitor_loop(
            Arc::downgrade(&inner),
            inner.monitor_wake.clone(),
        ));
        *inner.monitor.lock().expect("monitor slot") = Some(monitor);

        Ok(Session { inner })
    }

    /// Ask the monitor to connect now. Retries continue every two seconds
    /// until a connect succeeds or [`Session::disconnect`] is called.
    pub fn connect(&self) {
        let mut deadlines = self.inner.deadlines.lock().expect("deadlines");
        deadlines.connect_at = Some(Instant::now());
        drop(deadlines);
        self.inner.monitor_wake.notify_one();
    }

    /// Ask the monitor to tear the connection down now.
    pub fn disconnect(&self) {
        let mut deadlines = self.inner.deadlines.lock().expect("deadlines");
        deadlines.disconnect_at = Some(Instant::now());
        deadlines.connect_at = None;
        drop(deadlines);
        self.inner.monitor_wake.notify_one();
    }

    /// Stop the monitor and drop the connection. The session cannot be
    /// used afterwards.
    pub async fn shutdown(&self) {
        let monitor = self.inner.monitor.lock().expect("monitor slot").take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        do_disconnect(&self.inner).await;
    }

    pub fn state(&self) -> SessionState {
        self.inner.info.read().expect("info lock").state
    }

    pub fn connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn restored(&self) -> bool {
        self.state() == SessionState::Restored
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.inner.info.read().expect("info lock").sessionid
    }

    pub fn node_id(&self) -> Option<String> {
        self.inner.info.read().expect("info lock").nodeid.clone()
    }

    pub fn master_node_id(&self) -> Option<String> {
        self.inner
            .info
            .read()
            .expect("info lock")
            .master_nodeid
            .clone()
    }

    /// Whether the given node id is this session's own node.
    pub fn node_id_local(&self, nodeid: &str) -> bool {
        let info = self.inner.info.read().expect("info lock");
        info.state.is_connected() && info.nodeid.as_deref() == Some(nodeid)
    }

    /// The cluster-state mirror.
    pub fn store(&self) -> Arc<NodeStore> {
        self.inner.store.clone()
    }

    /// Repoint the session; takes effect on the next connect.
    pub fn set_target(&self, target: &str) -> Result<(), Error> {
        let target = Url::parse(target)?;
        if target.host_str().is_none() {
            return Err(Error::Config(format!("target uri '{target}' has no host")));
        }
        tracing::info!(target: LOG_TARGET, "updated session target to {target}");
        *self.inner.target.lock().expect("target lock") = target;
        Ok(())
    }

    pub fn on_state_change(&self, cb: impl Fn(SessionState) + Send + Sync + 'static) {
        *self.inner.on_state_change.lock().expect("state cb") = Some(Arc::new(cb));
    }

    pub fn on_auth_failed(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_auth_failed.lock().expect("auth cb") = Some(Arc::new(cb));
    }

    // ---------------------------------------------------------------
    // Registries
    // ---------------------------------------------------------------

    /// Register a handler for inbound `blade.execute` requests on the
    /// given protocol method. Replaces any previous handler.
    pub fn register_protocol_method(
        &self,
        protocol: &str,
        method: &str,
        handler: impl Fn(&ExecuteRequest, &mut Command) -> Result<(), Error> + Send + Sync + 'static,
    ) {
        self.inner
            .methods
            .write()
            .expect("methods lock")
            .insert(pmethod_key(protocol, method), Arc::new(handler));
    }

    pub fn unregister_protocol_method(&self, protocol: &str, method: &str) {
        self.inner
            .methods
            .write()
            .expect("methods lock")
            .remove(&pmethod_key(protocol, method));
    }

    /// Register a broadcast callback without sending anything upstream.
    /// [`Session::subscription_add`] does this as its first step.
    pub fn register_subscription_handler(
        &self,
        protocol: &str,
        channel: &str,
        handler: impl Fn(&BroadcastRequest) + Send + Sync + 'static,
    ) {
        self.inner
            .subscriptions
            .write()
            .expect("subscriptions lock")
            .insert(subscription_key(protocol, channel), Arc::new(handler));
    }

    pub fn unregister_subscription_handler(&self, protocol: &str, channel: &str) {
        self.inner
            .subscriptions
            .write()
            .expect("subscriptions lock")
            .remove(&subscription_key(protocol, channel));
    }

    /// The protocol `signalwire.setup` negotiated for a service, if any.
    pub fn setup_protocol(&self, service: &str) -> Option<String> {
        self.inner
            .setups
            .read()
            .expect("setups lock")
            .get(service)
            .cloned()
    }

    // ---------------------------------------------------------------
    // Metrics
    // ---------------------------------------------------------------

    /// Register a provider rank metric. The monitor reports the rank via
    /// `blade.protocol provider.rank.update` whenever it is dirty and its
    /// interval elapsed. Intervals are in seconds.
    pub fn metric_register(
        &self,
        protocol: &str,
        interval: Duration,
        rank: i32,
    ) -> Result<(), Error> {
        if protocol.is_empty() {
            return Err(Error::InvalidArgument("missing protocol for rank register"));
        }
        if interval.is_zero() {
            return Err(Error::InvalidArgument("rank interval must be positive"));
        }
        if rank < 0 {
            return Err(Error::InvalidArgument("rank must not be negative"));
        }

        let mut metrics = self.inner.metrics.write().expect("metrics lock");
        match metrics.get_mut(protocol) {
            Some(entry) => {
                tracing::debug!(target: LOG_TARGET, "metric update for '{protocol}'");
                entry.interval = interval;
                entry.rank = rank;
            }
            None => {
                tracing::debug!(target: LOG_TARGET, "metric added for '{protocol}'");
                metrics.insert(
                    protocol.to_owned(),
                    MetricEntry {
                        interval,
                        next_fire: Instant::now(),
                        rank,
                        dirty: true,
                    },
                );
            }
        }
        Ok(())
    }

    /// Update a registered rank; marks the metric dirty only when the
    /// rank actually changed.
    pub fn metric_update(&self, protocol: &str, rank: i32) -> Result<(), Error> {
        if protocol.is_empty() {
            return Err(Error::InvalidArgument("missing protocol for rank update"));
        }
        if rank < 0 {
            return Err(Error::InvalidArgument("rank must not be negative"));
        }
        let mut metrics = self.inner.metrics.write().expect("metrics lock");
        if let Some(entry) = metrics.get_mut(protocol) {
            if entry.rank != rank {
                entry.rank = rank;
                entry.dirty = true;
            }
        }
        Ok(())
    }

    /// The currently registered rank for a protocol.
    pub fn metric_current(&self, protocol: &str) -> Option<i32> {
        self.inner
            .metrics
            .read()
            .expect("metrics lock")
            .get(protocol)
            .map(|entry| entry.rank)
    }

    // ---------------------------------------------------------------
    // High-level helpers
    // ---------------------------------------------------------------

    /// Fire-and-forget a broadcast on a protocol channel.
    pub async fn broadcast(
        &self,
        protocol: &str,
        channel: &str,
        event: &str,
        params: Value,
    ) -> Result<(), Error> {
        let broadcaster_nodeid = self.node_id().ok_or(Error::NotConnected)?;
        let request = BroadcastRequest {
            protocol: protocol.to_owned(),
            channel: channel.to_owned(),
            event: event.to_owned(),
            broadcaster_nodeid,
            params,
        };
        let cmd =
            Command::request(BROADCAST_METHOD, &request)?.with_flags(CommandFlags::NOREPLY);
        submit_request(&self.inner, cmd).await?;
        Ok(())
    }

    /// Subscribe to a protocol channel and wait for the upstream's reply.
    ///
    /// The local callback is registered before the upstream accepts; if
    /// the request is rejected the callback stays registered and a retry
    /// simply replaces it.
    pub async fn subscription_add(
        &self,
        protocol: &str,
        channel: &str,
        handler: impl Fn(&BroadcastRequest) + Send + Sync + 'static,
    ) -> Result<Reply, Error> {
        let future = self.subscription_add_async(protocol, channel, handler).await?;
        wait_for_reply(&self.inner, future).await
    }

    pub async fn subscription_add_async(
        &self,
        protocol: &str,
        channel: &str,
        handler: impl Fn(&BroadcastRequest) + Send + Sync + 'static,
    ) -> Result<ResponseFuture, Error> {
        self.register_subscription_handler(protocol, channel, handler);
        let request = SubscriptionRequest {
            command: SUBSCRIPTION_CMD_ADD.to_owned(),
            protocol: protocol.to_owned(),
            channels: vec![channel.to_owned()],
        };
        submit_expecting_reply(&self.inner, Command::request(SUBSCRIPTION_METHOD, &request)?)
            .await
    }

    /// Drop a channel subscription, unregistering the local callback
    /// first.
    pub async fn subscription_remove(&self, protocol: &str, channel: &str) -> Result<Reply, Error> {
        let future = self.subscription_remove_async(protocol, channel).await?;
        wait_for_reply(&self.inner, future).await
    }

    pub async fn subscription_remove_async(
        &self,
        protocol: &str,
        channel: &str,
    ) -> Result<ResponseFuture, Error> {
        self.unregister_subscription_handler(protocol, channel);
        let request = SubscriptionRequest {
            command: SUBSCRIPTION_CMD_REMOVE.to_owned(),
            protocol: protocol.to_owned(),
            channels: vec![channel.to_owned()],
        };
        submit_expecting_reply(&self.inner, Command::request(SUBSCRIPTION_METHOD, &request)?)
            .await
    }

    /// Advertise this node as a provider of a protocol.
    pub async fn protocol_provider_add(
        &self,
        protocol: &str,
        spec: ProviderSpec,
    ) -> Result<Reply, Error> {
        let future = self.protocol_provider_add_async(protocol, spec).await?;
        wait_for_reply(&self.inner, future).await
    }

    pub async fn protocol_provider_add_async(
        &self,
        protocol: &str,
        spec: ProviderSpec,
    ) -> Result<ResponseFuture, Error> {
        let params = ProtocolProviderAddParams {
            default_method_execute_access: spec.method_execute_access,
            default_channel_subscribe_access: spec.channel_subscribe_access,
            default_channel_broadcast_access: spec.channel_broadcast_access,
            methods: spec.methods,
            channels: spec.channels,
            rank: spec.rank,
            data: spec.data,
        };
        let request = ProtocolRequest {
            command: CMD_PROVIDER_ADD.to_owned(),
            protocol: protocol.to_owned(),
            params: Some(serde_json::to_value(params)?),
        };
        submit_expecting_reply(&self.inner, Command::request(PROTOCOL_METHOD, &request)?).await
    }

    pub async fn protocol_provider_remove(&self, protocol: &str) -> Result<Reply, Error> {
        let future = self.protocol_provider_remove_async(protocol).await?;
        wait_for_reply(&self.inner, future).await
    }

    pub async fn protocol_provider_remove_async(
        &self,
        protocol: &str,
    ) -> Result<ResponseFuture, Error> {
        let request = ProtocolRequest {
            command: CMD_PROVIDER_REMOVE.to_owned(),
            protocol: protocol.to_owned(),
            params: None,
        };
        submit_expecting_reply(&self.inner, Command::request(PROTOCOL_METHOD, &request)?).await
    }

    pub async fn protocol_provider_rank_update(
        &self,
        protocol: &str,
        rank: i32,
    ) -> Result<Reply, Error> {
        let future = self
            .protocol_provider_rank_update_async(protocol, rank)
            .await?;
        wait_for_reply(&self.inner, future).await
    }

    pub async fn protocol_provider_rank_update_async(
        &self,
        protocol: &str,
        rank: i32,
    ) -> Result<ResponseFuture, Error> {
        protocol_provider_rank_update_async(&self.inner, protocol, rank).await
    }

    /// Attach an identity URI to this node.
    pub async fn identity_add(&self, identity: &str) -> Result<Reply, Error> {
        let future = self.identity_add_async(identity).await?;
        wait_for_reply(&self.inner, future).await
    }

    pub async fn identity_add_async(&self, identity: &str) -> Result<ResponseFuture, Error> {
        let request = IdentityRequest {
            command: IDENTITY_CMD_ADD.to_owned(),
            identities: vec![identity.to_owned()],
        };
        submit_expecting_reply(&self.inner, Command::request(IDENTITY_METHOD, &request)?).await
    }

    /// Execute a protocol method, optionally against a specific responder
    /// node, and wait for the reply.
    pub async fn execute(
        &self,
        responder: Option<&str>,
        protocol: &str,
        method: &str,
        params: Value,
    ) -> Result<Reply, Error> {
        let future = self.execute_async(responder, protocol, method, params).await?;
        wait_for_reply(&self.inner, future).await
    }

    pub async fn execute_async(
        &self,
        responder: Option<&str>,
        protocol: &str,
        method: &str,
        params: Value,
    ) -> Result<ResponseFuture, Error> {
        let request = ExecuteRequest {
            requester_nodeid: None,
            responder_nodeid: responder.map(str::to_owned),
            protocol: protocol.to_owned(),
            method: method.to_owned(),
            params,
        };
        let cmd = Command::request(EXECUTE_METHOD, &request)?;
        tracing::info!(target: LOG_TARGET, "TX: {cmd}");
        submit_expecting_reply(&self.inner, cmd).await
    }

    /// Execute with a caller-chosen request id, for external correlation.
    pub async fn execute_with_id(
        &self,
        id: Uuid,
        responder: Option<&str>,
        protocol: &str,
        method: &str,
        params: Value,
    ) -> Result<Reply, Error> {
        let request = ExecuteRequest {
            requester_nodeid: None,
            responder_nodeid: responder.map(str::to_owned),
            protocol: protocol.to_owned(),
            method: method.to_owned(),
            params,
        };
        let cmd = Command::request(EXECUTE_METHOD, &request)?.with_id(id);
        tracing::info!(target: LOG_TARGET, "TX: {cmd}");
        let future = submit_expecting_reply(&self.inner, cmd).await?;
        wait_for_reply(&self.inner, future).await
    }

    /// Negotiate a SignalWire service protocol: send `signalwire.setup`,
    /// wait for the returned protocol to surface in the node store, then
    /// subscribe to its `notifications` channel.
    pub async fn signalwire_setup(
        &self,
        service: &str,
        handler: impl Fn(&BroadcastRequest) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        if service.is_empty() {
            return Err(Error::InvalidArgument("missing service for setup"));
        }
        if !self.connected() {
            tracing::error!(
                target: LOG_TARGET,
                "setup for '{service}' failed because session is not connected"
            );
            return Err(Error::NotConnected);
        }

        let reply = self
            .execute(None, "signalwire", "setup", json!({"service": service}))
            .await?;
        let result: ExecuteResult = reply.result()?;
        let protocol = result
            .result
            .get("protocol")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::UnexpectedReply(format!(
                    "setup for '{service}' response has no result.protocol"
                ))
            })?;

        // Wait for the protocol to be seen locally; once it is, our
        // upstream knows it too and the subscribe below cannot outrun it.
        tracing::debug!(
            target: LOG_TARGET,
            "setup for '{service}' waiting for provider of protocol instance: {protocol}"
        );
        let mut found = false;
        for _ in 0..SETUP_POLL_ATTEMPTS {
            if self.inner.store.check_protocol(&protocol) {
                found = true;
                break;
            }
            tokio::time::sleep(SETUP_POLL_DELAY).await;
        }
        if !found {
            tracing::error!(
                target: LOG_TARGET,
                "setup for '{service}' protocol instance timeout"
            );
            return Err(Error::SetupTimeout(service.to_owned()));
        }

        self.subscription_add(&protocol, "notifications", handler)
            .await?;
        self.inner
            .setups
            .write()
            .expect("setups lock")
            .insert(service.to_owned(), protocol);
        Ok(())
    }

    /// Shorthand for `signalwire_setup("provisioning", ...)`.
    pub async fn provisioning_setup(
        &self,
        handler: impl Fn(&BroadcastRequest) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        self.signalwire_setup("provisioning", handler).await
    }

    /// Configure provisioning through the protocol negotiated by
    /// [`Session::provisioning_setup`].
    pub async fn provisioning_configure(
        &self,
        target: &str,
        local_endpoint: &str,
        external_endpoint: &str,
        relay_connector_id: &str,
    ) -> Result<Reply, Error> {
        if !self.connected() {
            return Err(Error::NotConnected);
        }
        let protocol = self.setup_protocol("provisioning").ok_or_else(|| {
            Error::Config("provisioning setup has not been performed".to_owned())
        })?;
        let params = json!({
            "target": target,
            "local_endpoint": local_endpoint,
            "external_endpoint": external_endpoint,
            "relay_connector_id": relay_connector_id,
        });
        self.execute(None, &protocol, "configure", params).await
    }

    /// Transport frame counters of the live connection, if any.
    pub async fn connection_stats(&self) -> Option<blade_rpc::StatsSnapshot> {
        self.inner.conn.read().await.as_ref().map(|c| c.stats())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("sessionid", &self.session_id())
            .finish()
    }
}

// -------------------------------------------------------------------
// Submission plumbing
// -------------------------------------------------------------------

async fn submit_request(
    inner: &Arc<SessionInner>,
    cmd: Command,
) -> Result<Option<ResponseFuture>, Error> {
    let conn = inner.conn.read().await.clone().ok_or(Error::NotConnected)?;
    Ok(conn.submit_request(cmd).await?)
}

async fn submit_expecting_reply(
    inner: &Arc<SessionInner>,
    cmd: Command,
) -> Result<ResponseFuture, Error> {
    submit_request(inner, cmd)
        .await?
        .ok_or(Error::InvalidArgument("command does not expect a reply"))
}

/// Wait for a reply; a waiter that gives up cancels the request so the
/// pending entry is released.
async fn wait_for_reply(inner: &Arc<SessionInner>, future: ResponseFuture) -> Result<Reply, Error> {
    let id = future.id();
    match future.wait().await {
        Ok(reply) => Ok(reply),
        Err(e) => {
            if let Some(conn) = inner.conn.read().await.clone() {
                conn.cancel(id);
            }
            Err(Error::Rpc(e))
        }
    }
}

async fn submit_result(inner: &Arc<SessionInner>, cmd: &Command) -> Result<(), Error> {
    let conn = inner.conn.read().await.clone().ok_or(Error::NotConnected)?;
    conn.submit_result(cmd).await?;
    Ok(())
}

async fn protocol_provider_rank_update_async(
    inner: &Arc<SessionInner>,
    protocol: &str,
    rank: i32,
) -> Result<ResponseFuture, Error> {
    let request = ProtocolRequest {
        command: CMD_PROVIDER_RANK_UPDATE.to_owned(),
        protocol: protocol.to_owned(),
        params: Some(serde_json::to_value(ProviderRankUpdateParams { rank })?),
    };
    submit_expecting_reply(inner, Command::request(PROTOCOL_METHOD, &request)?).await
}

// -------------------------------------------------------------------
// Result replay queue
// -------------------------------------------------------------------

fn enqueue_result(inner: &Arc<SessionInner>, cmd: Command) {
    let mut replay = inner.replay.lock().expect("replay lock");
    replay.push_back(QueuedResult {
        cmd,
        expires_at: Instant::now() + RESULT_REPLAY_TTL,
    });
}

/// Drain the replay queue in order, discarding entries whose expiry has
/// passed. Stops (requeueing the head) if the connection drops again.
async fn submit_results(inner: &Arc<SessionInner>) {
    loop {
        let next = {
            let mut replay = inner.replay.lock().expect("replay lock");
            loop {
                match replay.pop_front() {
                    None => break None,
                    Some(queued) if queued.expires_at < Instant::now() => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            "discarding expired queued result: {}",
                            queued.cmd
                        );
                    }
                    Some(queued) => break Some(queued),
                }
            }
        };
        let Some(queued) = next else { break };

        match submit_result(inner, &queued.cmd).await {
            Ok(()) => {
                tracing::info!(target: LOG_TARGET, "TX (replayed): {}", queued.cmd);
            }
            Err(_) => {
                let mut replay = inner.replay.lock().expect("replay lock");
                replay.push_front(queued);
                break;
            }
        }
    }
}

// -------------------------------------------------------------------
// Inbound dispatch
// -------------------------------------------------------------------

async fn dispatch_inbound(inner: &Arc<SessionInner>, mut cmd: Command) {
    tracing::debug!(target: LOG_TARGET, "handling incoming command: {cmd}");
    let method = cmd.method().to_owned();

    match method.as_str() {
        BROADCAST_METHOD => {
            let rqu: BroadcastRequest = match cmd.parse_request() {
                Ok(rqu) => rqu,
                Err(e) => {
                    tracing::error!(target: LOG_TARGET, "failed to parse broadcast command: {e}");
                    return;
                }
            };
            let handler = inner
                .subscriptions
                .read()
                .expect("subscriptions lock")
                .get(&subscription_key(&rqu.protocol, &rqu.channel))
                .cloned();
            match handler {
                Some(handler) => handler(&rqu),
                None => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        "could not locate sub for protocol: {} channel: {}",
                        rqu.protocol,
                        rqu.channel
                    );
                }
            }
        }
        DISCONNECT_METHOD => {
            // The upstream drops the socket after this; reply with an
            // empty result and keep reading until it does. Halting
            // outbound traffic until restored would be stricter, but the
            // fabric tolerates the race.
            if cmd.set_result(json!({})).is_ok() {
                if let Err(e) = submit_result(inner, &cmd).await {
                    tracing::error!(
                        target: LOG_TARGET,
                        "failed to submit reply to disconnect: {e}"
                    );
                }
            }
        }
        PING_METHOD => {
            let rqu: PingRequest = match cmd.parse_request() {
                Ok(rqu) => rqu,
                Err(e) => {
                    tracing::error!(target: LOG_TARGET, "failed to parse ping command: {e}");
                    return;
                }
            };
            let result = PingResult {
                timestamp: rqu.timestamp,
                payload: rqu.payload,
            };
            let result = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
            if cmd.set_result(result).is_ok() {
                if let Err(e) = submit_result(inner, &cmd).await {
                    tracing::error!(target: LOG_TARGET, "failed to submit reply to ping: {e}");
                }
            }
        }
        NETCAST_METHOD => {
            let rqu: NetcastRequest = match cmd.parse_request() {
                Ok(rqu) => rqu,
                Err(e) => {
                    tracing::error!(target: LOG_TARGET, "failed to parse netcast command: {e}");
                    return;
                }
            };
            match inner.store.update(&rqu) {
                Ok(()) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        "updated nodestore with netcast command: {}",
                        rqu.command
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        "failed to update nodestore from netcast command {}: {e}",
                        rqu.command
                    );
                }
            }
        }
        EXECUTE_METHOD => {
            let rqu: ExecuteRequest = match cmd.parse_request() {
                Ok(rqu) => rqu,
                Err(e) => {
                    tracing::warn!(target: LOG_TARGET, "failed to parse execute payload: {e}");
                    return;
                }
            };
            tracing::info!(target: LOG_TARGET, "RX: {cmd}");
            execute_inbound(inner, rqu, cmd).await;
        }
        other => {
            tracing::warn!(target: LOG_TARGET, "not handling incoming command: {other}");
        }
    }
}

async fn execute_inbound(inner: &Arc<SessionInner>, rqu: ExecuteRequest, mut cmd: Command) {
    let key = pmethod_key(&rqu.protocol, &rqu.method);
    let handler = inner
        .methods
        .read()
        .expect("methods lock")
        .get(&key)
        .cloned();

    let mut failure: Option<(i64, String)> = None;
    match handler {
        None => {
            failure = Some((
                ERR_METHOD_NOT_FOUND,
                format!("no registered handler for protocol method: {key}"),
            ));
        }
        Some(handler) => {
            tracing::debug!(
                target: LOG_TARGET,
                "initiating execute for protocol: {}",
                rqu.protocol
            );
            if let Err(e) = handler(&rqu, &mut cmd) {
                failure = Some((
                    ERR_HANDLER_FAILED,
                    format!("protocol method handler returned an error: {e}"),
                ));
            }
        }
    }

    // A handler that reported success but never set a result gets a
    // manufactured error too.
    if failure.is_none() && !cmd.is_terminal() {
        failure = Some((
            ERR_NO_RESULT_SET,
            format!("protocol method handler failed to set a result for: {key}"),
        ));
    }

    if let Some((code, message)) = failure {
        tracing::warn!(target: LOG_TARGET, "{message}");
        let payload = ExecuteError {
            requester_nodeid: rqu.requester_nodeid.clone(),
            responder_nodeid: rqu.responder_nodeid.clone(),
            code,
            message,
        };
        let payload = serde_json::to_value(&payload).unwrap_or_else(|_| json!({"code": code}));
        // The command may already be terminal (a handler that set a
        // result and then errored); rebuild the reply from scratch.
        let mut error_cmd = Command::from_inbound(cmd.id(), cmd.method().to_owned(), json!({}));
        error_cmd
            .set_error(payload)
            .expect("fresh command accepts a terminal transition");
        cmd = error_cmd;
    }

    match submit_result(inner, &cmd).await {
        Ok(()) => {
            tracing::info!(target: LOG_TARGET, "TX: {cmd}");
        }
        Err(Error::NotConnected) | Err(Error::Rpc(blade_rpc::Error::Disconnected)) => {
            // Send it after reconnection; the upstream re-requests only
            // for so long, hence the queue expiry.
            tracing::info!(target: LOG_TARGET, "(not connected) TX ENQUEUE: {cmd}");
            enqueue_result(inner, cmd);
        }
        Err(e) => {
            tracing::error!(target: LOG_TARGET, "TX FAILED {cmd}: {e}");
        }
    }
}

// -------------------------------------------------------------------
// Monitor and connect/disconnect procedures
// -------------------------------------------------------------------

async fn monitor_loop(weak: Weak<SessionInner>, wake: Arc<Notify>) {
    tracing::debug!(target: LOG_TARGET, "session monitor starting");
    loop {
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(MONITOR_TICK) => {}
        }
        let Some(inner) = weak.upgrade() else { break };
        check_session_state(&inner).await;
    }
    tracing::debug!(target: LOG_TARGET, "session monitor stopping");
}

async fn check_session_state(inner: &Arc<SessionInner>) {
    // Metric scheduler: report dirty ranks whose interval elapsed.
    let due: Vec<(String, i32)> = {
        let mut metrics = inner.metrics.write().expect("metrics lock");
        let now = Instant::now();
        metrics
            .iter_mut()
            .filter(|(_, entry)| entry.dirty && now >= entry.next_fire)
            .map(|(protocol, entry)| {
                entry.next_fire = now + entry.interval;
                entry.dirty = false;
                (protocol.clone(), entry.rank)
            })
            .collect()
    };
    for (protocol, rank) in due {
        match protocol_provider_rank_update_async(inner, &protocol, rank).await {
            // Fire and forget; the reply (or its timeout) is dropped.
            Ok(_future) => {}
            Err(e) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    "failed to report rank for '{protocol}': {e}"
                );
            }
        }
    }

    let now = Instant::now();

    let disconnect_due = {
        let mut deadlines = inner.deadlines.lock().expect("deadlines");
        match deadlines.disconnect_at {
            Some(at) if now >= at => {
                deadlines.disconnect_at = None;
                true
            }
            _ => false,
        }
    };
    if disconnect_due {
        let was_connected = inner.info.read().expect("info lock").state.is_connected();
        if was_connected {
            do_disconnect(inner).await;
            inner.info.write().expect("info lock").state = SessionState::Offline;
            fire_state_change(inner);
        }
    }

    let connect_due = {
        let deadlines = inner.deadlines.lock().expect("deadlines");
        deadlines.connect_at.is_some_and(|at| now >= at)
    };
    if connect_due {
        match do_connect(inner).await {
            Ok(()) => {
                inner.deadlines.lock().expect("deadlines").connect_at = None;
                fire_state_change(inner);
            }
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, "connect failed, retrying in 2s: {e}");
                inner.deadlines.lock().expect("deadlines").connect_at =
                    Some(Instant::now() + CONNECT_RETRY_DELAY);
            }
        }
    }
}

fn fire_state_change(inner: &Arc<SessionInner>) {
    let handler = inner.on_state_change.lock().expect("state cb").clone();
    if let Some(handler) = handler {
        let state = inner.info.read().expect("info lock").state;
        handler(state);
    }
}

async fn do_disconnect(inner: &Arc<SessionInner>) {
    let conn = inner.conn.write().await.take();
    if let Some(conn) = conn {
        conn.shutdown().await;
    }
}

async fn do_connect(inner: &Arc<SessionInner>) -> Result<(), Error> {
    let config = inner.config.lock().expect("config lock").clone();
    // Checked at connect time so credentials picked up from the
    // environment after session creation still count.
    if !config.has_authentication() {
        tracing::error!(
            target: LOG_TARGET,
            "cannot connect without certificates or authentication"
        );
        return Err(Error::Config(
            "no certificates or authentication configured".to_owned(),
        ));
    }

    tracing::debug!(target: LOG_TARGET, "session is performing connect");

    // Tear down any previous connection before dialing again.
    do_disconnect(inner).await;

    let url = inner.target.lock().expect("target lock").clone();
    let address = url
        .host_str()
        .ok_or_else(|| Error::Config("target uri has no host".to_owned()))?
        .to_owned();
    let port = url.port().unwrap_or(DEFAULT_PORT);
    let path = url.path().trim_start_matches('/').to_owned();

    // A fresh TLS context every attempt, so rotated cert files apply.
    let tls = if url.scheme() == "ws" {
        None
    } else {
        Some(client_config(&TlsMaterial {
            private_key_path: config.private_key_path.as_deref(),
            client_cert_path: config.client_cert_path.as_deref(),
            cert_chain_path: config.cert_chain_path.as_deref(),
        })?)
    };

    let params = ConnectParams {
        sessionid: inner.info.read().expect("info lock").sessionid,
        authentication: config.authentication_json()?,
        agent: config.agent.clone(),
        identity: config.identity.clone(),
        network: Some(config.network()),
    };

    let target = ConnectionTarget {
        address,
        port,
        path,
        connect_timeout: CONNECT_TIMEOUT,
        tls,
    };

    let conn = match Connection::connect(&target, params, connection_hooks(inner)).await {
        Ok(conn) => conn,
        Err(e) => {
            if let blade_rpc::Error::Rpc(error) = &e {
                if error.code == AUTH_FAILED_CODE {
                    let handler = inner.on_auth_failed.lock().expect("auth cb").clone();
                    if let Some(handler) = handler {
                        handler();
                    }
                }
            }
            return Err(e.into());
        }
    };

    let result = conn.connect_result().clone();

    if result.session_restored {
        tracing::debug!(target: LOG_TARGET, "restored session");
    } else {
        inner.store.reset();
        inner.store.populate(&result);
    }

    {
        let mut info = inner.info.write().expect("info lock");
        info.state = match info.sessionid {
            Some(previous) if previous == result.sessionid => SessionState::Restored,
            Some(previous) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    "new session id created (old: {previous}, new: {}), all state invalidated",
                    result.sessionid
                );
                SessionState::Online
            }
            None => SessionState::Online,
        };
        info.sessionid = Some(result.sessionid);
        info.nodeid = Some(result.nodeid.clone());
        info.master_nodeid = Some(result.master_nodeid.clone());
    }

    *inner.conn.write().await = Some(Arc::new(conn));

    tracing::info!(
        target: LOG_TARGET,
        "successfully established sessionid: {} nodeid: {} master_nodeid: {}",
        result.sessionid,
        result.nodeid,
        result.master_nodeid
    );

    // Send any results that were enqueued during the disconnect.
    submit_results(inner).await;

    Ok(())
}

fn connection_hooks(inner: &Arc<SessionInner>) -> ConnectionHooks {
    let request_weak = Arc::downgrade(inner);
    let failed_weak = Arc::downgrade(inner);

    ConnectionHooks {
        on_request: Arc::new(move |cmd| {
            let weak = request_weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    dispatch_inbound(&inner, cmd).await;
                }
            }
            .boxed()
        }),
        on_failed: Arc::new(move || {
            let Some(inner) = failed_weak.upgrade() else {
                return;
            };
            let now = Instant::now();
            {
                let mut deadlines = inner.deadlines.lock().expect("deadlines");
                deadlines.disconnect_at = Some(now);
                deadlines.connect_at = Some(now + RECONNECT_DELAY);
            }
            inner.monitor_wake.notify_one();
        }),
    }
}
