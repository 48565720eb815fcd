// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! The framed WebSocket transport: connect with retry, a background reader
//! with ping/pong keepalive, and serialized writes.

use crate::Error;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "blade-transport";

/// How long the reader blocks on the socket before checking keepalive.
const READ_POLL: Duration = Duration::from_secs(1);

/// Interval between keepalive pings on an idle socket.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Transport-level connect attempts before the error is surfaced.
const CONNECT_ATTEMPTS: u32 = 2;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Invoked exactly once when the transport fails.
pub type FailedHook = Arc<dyn Fn() + Send + Sync>;

/// Where to connect: host, port and the undecorated handshake path.
#[derive(Debug, Clone)]
pub struct TransportTarget {
    pub address: String,
    pub port: u16,
    pub path: String,
    pub connect_timeout: Duration,
}

/// Frame counters, readable at any time as a snapshot.
#[derive(Debug, Default)]
pub struct TransportStats {
    read_frames: AtomicU64,
    write_frames: AtomicU64,
}

/// A point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub read_frames: u64,
    pub write_frames: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_frames: self.read_frames.load(Ordering::Relaxed),
            write_frames: self.write_frames.load(Ordering::Relaxed),
        }
    }
}

struct Writer {
    sink: tokio::sync::Mutex<WsSink>,
    stats: Arc<TransportStats>,
    failed: AtomicBool,
    /// Set by an orderly shutdown; errors seen after this are expected
    /// and must not fire the failed hook.
    closing: AtomicBool,
    on_failed: FailedHook,
}

impl Writer {
    /// Serialize one frame onto the socket. All writes (application text,
    /// ping, pong) funnel through the sink mutex.
    async fn write(&self, message: Message) -> Result<(), Error> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        let mut sink = self.sink.lock().await;
        match sink.send(message).await {
            Ok(()) => {
                self.stats.write_frames.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                drop(sink);
                tracing::warn!(target: LOG_TARGET, "failed to write frame: {e}");
                self.mark_failed();
                Err(Error::Disconnected)
            }
        }
    }

    fn mark_failed(&self) {
        let was_failed = self.failed.swap(true, Ordering::AcqRel);
        if was_failed || self.closing.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(target: LOG_TARGET, "reporting transport failure");
        (self.on_failed)();
    }
}

/// A connected WebSocket with its background reader.
///
/// Dropping the transport stops the reader and closes the socket; an
/// explicit [`WsTransport::shutdown`] does the same but lets the close
/// frame go out first.
pub struct WsTransport {
    writer: Arc<Writer>,
    shutdown: CancellationToken,
    reader: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Connect to the target, decorating the handshake path as
    /// `/<path>:<address>:swclt`. Two attempts are made, one second apart;
    /// the session layer owns any further retrying.
    pub async fn connect(
        target: &TransportTarget,
        tls: Option<Arc<rustls::ClientConfig>>,
        inbound: mpsc::Sender<String>,
        on_failed: FailedHook,
    ) -> Result<WsTransport, Error> {
        let mut last_err = Error::ConnectTimeout;
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            tracing::info!(
                target: LOG_TARGET,
                "performing connect try {attempt} to {}:{}/{}",
                target.address,
                target.port,
                target.path
            );
            match Self::connect_once(target, tls.clone(), inbound.clone(), on_failed.clone())
                .await
            {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    tracing::warn!(target: LOG_TARGET, "connect attempt {attempt} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn connect_once(
        target: &TransportTarget,
        tls: Option<Arc<rustls::ClientConfig>>,
        inbound: mpsc::Sender<String>,
        on_failed: FailedHook,
    ) -> Result<WsTransport, Error> {
        let scheme = if tls.is_some() { "wss" } else { "ws" };
        let url = format!(
            "{scheme}://{address}:{port}/{path}:{address}:swclt",
            address = target.address,
            port = target.port,
            path = target.path,
        );
        let request = url.clone().into_client_request()?;
        let connector = tls.map(Connector::Rustls);

        let (stream, _response) = tokio::time::timeout(
            target.connect_timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector),
        )
        .await
        .map_err(|_| Error::ConnectTimeout)??;

        tracing::info!(target: LOG_TARGET, "websocket established to {url}");

        let (sink, stream) = stream.split();
        let writer = Arc::new(Writer {
            sink: tokio::sync::Mutex::new(sink),
            stats: Arc::new(TransportStats::default()),
            failed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            on_failed,
        });
        let shutdown = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            stream,
            writer.clone(),
            inbound,
            shutdown.clone(),
        ));

        Ok(WsTransport {
            writer,
            shutdown,
            reader,
        })
    }

    /// Write one application text frame.
    pub async fn write_text(&self, text: String) -> Result<(), Error> {
        self.writer.write(Message::Text(text.into())).await
    }

    /// Whether the transport has failed; failed transports refuse writes.
    pub fn is_failed(&self) -> bool {
        self.writer.failed.load(Ordering::Acquire)
    }

    /// A snapshot of the frame counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.writer.stats.snapshot()
    }

    /// A shared handle to the live counters, for periodic stats reporting.
    pub fn stats_handle(&self) -> Arc<TransportStats> {
        self.writer.stats.clone()
    }

    /// Stop the reader and close the socket.
    pub async fn shutdown(&self) {
        self.writer.closing.store(true, Ordering::Release);
        self.shutdown.cancel();
        let mut sink = self.writer.sink.lock().await;
        let _ = sink.close().await;
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.writer.closing.store(true, Ordering::Release);
        self.shutdown.cancel();
        self.reader.abort();
    }
}

async fn read_loop(
    mut stream: WsStream,
    writer: Arc<Writer>,
    inbound: mpsc::Sender<String>,
    shutdown: CancellationToken,
) {
    tracing::debug!(target: LOG_TARGET, "websocket reader starting");
    let mut next_ping = Instant::now() + PING_INTERVAL;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(target: LOG_TARGET, "websocket reader exiting due to stop request");
                return;
            }
            frame = tokio::time::timeout(READ_POLL, stream.next()) => frame,
        };

        let message = match frame {
            // Poll woke without data; keepalive check.
            Err(_) => {
                if Instant::now() >= next_ping {
                    tracing::debug!(target: LOG_TARGET, "PING");
                    if writer.write(Message::Ping(vec![0u8; 8].into())).await.is_err() {
                        return;
                    }
                    next_ping = Instant::now() + PING_INTERVAL;
                }
                continue;
            }
            Ok(None) => {
                tracing::warn!(target: LOG_TARGET, "websocket closed by peer");
                writer.mark_failed();
                return;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(target: LOG_TARGET, "read frame failed: {e}");
                writer.mark_failed();
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        writer.stats.read_frames.fetch_add(1, Ordering::Relaxed);

        match message {
            Message::Text(text) => {
                // Hand the frame to the single-consumer dispatch queue; a
                // closed queue means the connection is shutting down.
                if inbound.send(text.to_string()).await.is_err() {
                    return;
                }
            }
            Message::Ping(payload) => {
                tracing::debug!(target: LOG_TARGET, "PING from peer");
                if writer.write(Message::Pong(payload)).await.is_err() {
                    return;
                }
            }
            Message::Pong(_) => {
                tracing::debug!(target: LOG_TARGET, "PONG");
            }
            Message::Close(_) => {
                tracing::warn!(target: LOG_TARGET, "close frame from peer");
                writer.mark_failed();
                return;
            }
            other => {
                tracing::debug!(target: LOG_TARGET, "ignoring frame: {other:?}");
            }
        }
    }
}
