// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! The request/reply correlation engine.
//!
//! A [`Connection`] owns one WebSocket transport, the pending-request map,
//! the TTL tracker, and a single-consumer dispatch task that processes
//! inbound frames in arrival order: replies are matched by id against the
//! pending map, requests are handed to the owner's hook.

use crate::command::{Command, FailureStatus, Reply, ResponseFuture};
use crate::frame::RpcFrame;
use crate::methods::connect::{ConnectRequest, ConnectResult, NetworkFilter, CONNECT_METHOD, VERSION};
use crate::transport::{FailedHook, TransportStats, TransportTarget, StatsSnapshot, WsTransport};
use crate::ttl::TtlHeap;
use crate::Error;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use uuid::Uuid;

const LOG_TARGET: &str = "blade-connection";

/// Inbound frames queued for the dispatch task before backpressure hits
/// the reader.
const INBOUND_QUEUE_DEPTH: usize = 64;

/// Longest the TTL tracker sleeps before re-checking the heap.
const MAX_TTL_WAIT: Duration = Duration::from_secs(5);

/// How often the dispatch task emits a connection stats line.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Handler for inbound requests. Invocations are serialized by the
/// dispatch task, in frame arrival order.
pub type RequestHook = Arc<dyn Fn(Command) -> BoxFuture<'static, ()> + Send + Sync>;

/// The owner's hooks into connection events.
#[derive(Clone)]
pub struct ConnectionHooks {
    /// An inbound request arrived (broadcast, execute, netcast, ...).
    pub on_request: RequestHook,
    /// The transport failed; fired exactly once per connection.
    pub on_failed: FailedHook,
}

/// Where to connect and how.
#[derive(Clone)]
pub struct ConnectionTarget {
    pub address: String,
    pub port: u16,
    pub path: String,
    pub connect_timeout: Duration,
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl ConnectionTarget {
    fn transport_target(&self) -> TransportTarget {
        TransportTarget {
            address: self.address.clone(),
            port: self.port,
            path: self.path.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

/// The logical-connect parameters carried in `blade.connect`.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Prior session id, making this a session-resume attempt.
    pub sessionid: Option<Uuid>,
    pub authentication: Option<Value>,
    pub agent: Option<String>,
    pub identity: Option<String>,
    pub network: Option<NetworkFilter>,
}

struct PendingEntry {
    method: String,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct PendingState {
    map: HashMap<Uuid, PendingEntry>,
    heap: TtlHeap,
}

struct Shared {
    pending: Mutex<PendingState>,
    ttl_wake: Notify,
}

/// One connected transport plus its correlation state. Replaced wholesale
/// by the session on every reconnect.
pub struct Connection {
    transport: WsTransport,
    shared: Arc<Shared>,
    dispatch: Mutex<Option<tokio::task::JoinHandle<()>>>,
    ttl_task: tokio::task::JoinHandle<()>,
    result: ConnectResult,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Open the transport, start the dispatch and TTL tasks, then perform
    /// the logical `blade.connect` exchange synchronously. The parsed
    /// connect result seeds (or resumes) the caller's session state.
    pub async fn connect(
        target: &ConnectionTarget,
        params: ConnectParams,
        hooks: ConnectionHooks,
    ) -> Result<Connection, Error> {
        let (frames_tx, frames_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let transport = WsTransport::connect(
            &target.transport_target(),
            target.tls.clone(),
            frames_tx,
            hooks.on_failed.clone(),
        )
        .await?;

        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingState::default()),
            ttl_wake: Notify::new(),
        });
        let ttl_task = tokio::spawn(ttl_loop(shared.clone()));
        let dispatch = tokio::spawn(dispatch_loop(
            frames_rx,
            shared.clone(),
            hooks.on_request,
            transport.stats_handle(),
        ));

        match logical_connect(&transport, &shared, &params).await {
            Ok(result) => {
                tracing::info!(
                    target: LOG_TARGET,
                    "logical connect complete, sessionid: {} nodeid: {}",
                    result.sessionid,
                    result.nodeid
                );
                Ok(Connection {
                    transport,
                    shared,
                    dispatch: Mutex::new(Some(dispatch)),
                    ttl_task,
                    result,
                })
            }
            Err(e) => {
                dispatch.abort();
                ttl_task.abort();
                transport.shutdown().await;
                drain_pending(&shared);
                Err(e)
            }
        }
    }

    /// The parsed `blade.connect` reply this connection was established
    /// with.
    pub fn connect_result(&self) -> &ConnectResult {
        &self.result
    }

    /// Submit a request. When a reply is expected the command is
    /// registered in the pending map and its deadline in the TTL heap, and
    /// a [`ResponseFuture`] is handed back; NOREPLY commands return `None`.
    pub async fn submit_request(&self, cmd: Command) -> Result<Option<ResponseFuture>, Error> {
        submit_request_inner(&self.transport, &self.shared, cmd).await
    }

    /// Write a result or error command back to the upstream. Failure
    /// commands have no wire form and requests cannot be sent this way.
    pub async fn submit_result(&self, cmd: &Command) -> Result<(), Error> {
        if self.transport.is_failed() {
            return Err(Error::Disconnected);
        }
        if !cmd.is_result() && !cmd.is_error() {
            tracing::error!(target: LOG_TARGET, "invalid command type to send as result: {cmd}");
            return Err(Error::InvalidCommandState(
                "only results and errors can be submitted as replies",
            ));
        }
        self.transport.write_text(cmd.render()?).await
    }

    /// Cancel a pending request: the entry is removed and the command
    /// completed with a cancellation failure. Unknown ids are a no-op (the
    /// reply may have just arrived).
    pub fn cancel(&self, id: Uuid) {
        if let Some(entry) = remove_pending(&self.shared, id) {
            tracing::warn!(
                target: LOG_TARGET,
                "canceled request {id} ({})", entry.method
            );
            let _ = entry.tx.send(Reply::Failure {
                status: FailureStatus::Cancelled,
                reason: format!("canceled request {id}"),
            });
        }
    }

    /// Whether the underlying transport has failed.
    pub fn is_failed(&self) -> bool {
        self.transport.is_failed()
    }

    /// Transport frame counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.transport.stats()
    }

    /// Close the socket, let the dispatch task finish its backlog (an
    /// in-flight handler runs to completion and may queue its reply for
    /// replay), then complete every still-pending command with a
    /// disconnect failure.
    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
        let dispatch = self.dispatch.lock().expect("dispatch slot").take();
        if let Some(dispatch) = dispatch {
            let _ = dispatch.await;
        }
        self.ttl_task.abort();
        drain_pending(&self.shared);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.lock().expect("dispatch slot").take() {
            dispatch.abort();
        }
        self.ttl_task.abort();
        drain_pending(&self.shared);
    }
}

fn remove_pending(shared: &Shared, id: Uuid) -> Option<PendingEntry> {
    // The heap entry stays behind and is discarded lazily on expiry.
    shared.pending.lock().expect("pending lock").map.remove(&id)
}

fn drain_pending(shared: &Shared) {
    let entries: Vec<(Uuid, PendingEntry)> = {
        let mut pending = shared.pending.lock().expect("pending lock");
        pending.map.drain().collect()
    };
    for (id, entry) in entries {
        let _ = entry.tx.send(Reply::Failure {
            status: FailureStatus::Disconnected,
            reason: format!("connection closed before reply to {id}"),
        });
    }
}

async fn submit_request_inner(
    transport: &WsTransport,
    shared: &Arc<Shared>,
    cmd: Command,
) -> Result<Option<ResponseFuture>, Error> {
    if transport.is_failed() {
        return Err(Error::Disconnected);
    }

    let text = cmd.render()?;
    tracing::debug!(target: LOG_TARGET, "submitting request: {cmd}");

    let future = if cmd.expects_reply() {
        let (tx, rx) = oneshot::channel();
        let expiry = Instant::now() + cmd.response_ttl();
        {
            let mut pending = shared.pending.lock().expect("pending lock");
            let woke_earlier = pending.heap.insert(expiry, cmd.id()).map_err(|()| {
                tracing::error!(
                    target: LOG_TARGET,
                    "failed to track TTL for command {}: heap at capacity",
                    cmd.id()
                );
                Error::TtlCapacity
            })?;
            pending.map.insert(
                cmd.id(),
                PendingEntry {
                    method: cmd.method().to_owned(),
                    tx,
                },
            );
            if woke_earlier {
                shared.ttl_wake.notify_one();
            }
        }
        Some(ResponseFuture::new(cmd.id(), cmd.response_ttl(), rx))
    } else {
        None
    };

    // A write failure leaves a registered command tracked; the failed hook
    // and the TTL tracker drain it.
    transport.write_text(text).await?;

    Ok(future)
}

async fn logical_connect(
    transport: &WsTransport,
    shared: &Arc<Shared>,
    params: &ConnectParams,
) -> Result<ConnectResult, Error> {
    let request = ConnectRequest {
        version: VERSION,
        sessionid: params.sessionid,
        authentication: params.authentication.clone(),
        agent: params.agent.clone(),
        identity: params.identity.clone(),
        network: params.network.clone(),
    };
    let cmd = Command::request(CONNECT_METHOD, &request)?;
    let id = cmd.id();

    let future = submit_request_inner(transport, shared, cmd)
        .await?
        .expect("connect expects a reply");

    let reply = match future.wait().await {
        Ok(reply) => reply,
        Err(e) => {
            remove_pending(shared, id);
            return Err(e);
        }
    };

    match reply {
        Reply::Result(json) => Ok(serde_json::from_value(json)?),
        Reply::Error(_) => {
            let error = reply.error_object().expect("error replies decode");
            tracing::error!(target: LOG_TARGET, "blade.connect failed: {error}");
            Err(Error::Rpc(error))
        }
        Reply::Failure { status, reason } => Err(Error::Failure { status, reason }),
    }
}

async fn dispatch_loop(
    mut frames: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    on_request: RequestHook,
    stats: Arc<TransportStats>,
) {
    let mut last_stats = Instant::now();

    while let Some(text) = frames.recv().await {
        match text.parse::<RpcFrame>() {
            // Malformed envelopes are logged and discarded; never fatal.
            // One exception: a frame that still correlates to a pending
            // command consumes it with a parse failure.
            Err(e) => {
                let id = serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|value| value.get("id").cloned())
                    .and_then(|id| serde_json::from_value::<Uuid>(id).ok());
                match id {
                    Some(id) => deliver(
                        &shared,
                        id,
                        Reply::Failure {
                            status: FailureStatus::ParseError,
                            reason: format!("failed to parse reply to {id}: {e}"),
                        },
                    ),
                    None => {
                        tracing::warn!(target: LOG_TARGET, "received invalid payload: {e}");
                    }
                }
            }
            Ok(RpcFrame::Request { id, method, params }) => {
                match serde_json::from_str::<Value>(params.get()) {
                    Ok(params) => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            "dispatching incoming request method: {method} id: {id}"
                        );
                        on_request(Command::from_inbound(id, method, params)).await;
                    }
                    Err(e) => {
                        tracing::warn!(target: LOG_TARGET, "invalid request params: {e}");
                    }
                }
            }
            Ok(RpcFrame::Result { id, result }) => {
                let result = serde_json::from_str(result.get()).unwrap_or(Value::Null);
                deliver(&shared, id, Reply::Result(result));
            }
            Ok(RpcFrame::Error { id, error }) => {
                let error = serde_json::from_str(error.get()).unwrap_or(Value::Null);
                deliver(&shared, id, Reply::Error(error));
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            let snapshot = stats.snapshot();
            let heap_len = shared.pending.lock().expect("pending lock").heap.len();
            tracing::info!(
                target: LOG_TARGET,
                read_frames = snapshot.read_frames,
                write_frames = snapshot.write_frames,
                ttl_heap = heap_len,
                queued = frames.len(),
                "connection stats"
            );
            last_stats = Instant::now();
        }
    }
}

fn deliver(shared: &Shared, id: Uuid, reply: Reply) {
    match remove_pending(shared, id) {
        Some(entry) => {
            // The waiter may have given up already; that is fine.
            let _ = entry.tx.send(reply);
        }
        None => {
            // Command probably timed out, was cancelled, or we never asked
            // for this reply.
            tracing::debug!(
                target: LOG_TARGET,
                "could not locate pending command for reply {id}"
            );
        }
    }
}

async fn ttl_loop(shared: Arc<Shared>) {
    tracing::info!(target: LOG_TARGET, "TTL tracker running");
    loop {
        let wait = {
            let pending = shared.pending.lock().expect("pending lock");
            match pending.heap.next_expiry() {
                None => MAX_TTL_WAIT,
                Some(expiry) => expiry
                    .saturating_duration_since(Instant::now())
                    .min(MAX_TTL_WAIT),
            }
        };

        if !wait.is_zero() {
            tokio::select! {
                _ = shared.ttl_wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let expired: Vec<(Uuid, PendingEntry)> = {
            let mut pending = shared.pending.lock().expect("pending lock");
            let now = Instant::now();
            let mut expired = Vec::new();
            while let Some(id) = pending.heap.pop_expired(now) {
                // Entries whose reply already arrived resolve to nothing
                // here and are discarded silently.
                if let Some(entry) = pending.map.remove(&id) {
                    expired.push((id, entry));
                }
            }
            expired
        };

        for (id, entry) in expired {
            tracing::info!(
                target: LOG_TARGET,
                "TTL expired for command {id} ({})", entry.method
            );
            let _ = entry.tx.send(Reply::Failure {
                status: FailureStatus::Timeout,
                reason: format!("TTL expired for command {id}"),
            });
        }
    }
}
