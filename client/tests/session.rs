// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! End-to-end session behavior against an in-process mock node.

use blade_client::{Config, Session, SessionState};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

type ServerWs = WebSocketStream<TcpStream>;

const EVENT_WAIT: Duration = Duration::from_secs(5);

async fn bind() -> (TcpListener, u16) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn next_frame(ws: &mut ServerWs) -> Option<Value> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(Message::Ping(payload)) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
}

async fn send_json(ws: &mut ServerWs, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

/// Handle the blade.connect exchange; returns the connect request.
async fn handle_connect(
    ws: &mut ServerWs,
    sessionid: Uuid,
    session_restored: bool,
    protocols: Value,
) -> Value {
    let request = next_frame(ws).await.expect("connect request");
    assert_eq!(request["method"], "blade.connect");
    send_json(
        ws,
        json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {
                "session_restored": session_restored,
                "sessionid": sessionid,
                "nodeid": "mock-node",
                "master_nodeid": "mock-master",
                "protocols": protocols,
            },
        }),
    )
    .await;
    request
}

fn auth_config() -> Config {
    let mut config = Config::default();
    config.authentication = Some(r#"{"project":"proj","token":"tok"}"#.into());
    config
}

fn session_for(port: u16) -> (Session, mpsc::UnboundedReceiver<SessionState>) {
    let session = Session::new(&format!("ws://127.0.0.1:{port}/api"), auth_config()).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    session.on_state_change(move |state| {
        let _ = tx.send(state);
    });
    (session, rx)
}

async fn expect_state(rx: &mut mpsc::UnboundedReceiver<SessionState>) -> SessionState {
    timeout(EVENT_WAIT, rx.recv())
        .await
        .expect("timed out waiting for a state change")
        .expect("state channel closed")
}

fn seed_protocols() -> Value {
    json!([{
        "name": "proto_keep",
        "default_method_execute_access": 1,
        "default_channel_broadcast_access": 1,
        "default_channel_subscribe_access": 1,
        "providers": [{"nodeid": "other-node", "rank": 1}],
        "channels": [],
    }])
}

// An uncertified client (authentication only, no certs) connects,
// disconnects and reconnects, with the state-change callback firing for
// each transition; the resumed session keeps its node store.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_disconnect_resume_cycle() {
    let (listener, port) = bind().await;
    let sessionid = Uuid::new_v4();

    let server = tokio::spawn(async move {
        // First connection: fresh session.
        let mut ws = accept(&listener).await;
        let request = handle_connect(&mut ws, sessionid, false, seed_protocols()).await;
        assert!(request["params"].get("sessionid").is_none());
        assert_eq!(request["params"]["authentication"]["project"], "proj");
        // Read until the client disconnects.
        while next_frame(&mut ws).await.is_some() {}

        // Second connection: the client offers its session id, resume it.
        let mut ws = accept(&listener).await;
        let request = next_frame(&mut ws).await.expect("reconnect request");
        assert_eq!(request["params"]["sessionid"], json!(sessionid));
        send_json(
            &mut ws,
            json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {
                    "session_restored": true,
                    "sessionid": sessionid,
                    "nodeid": "mock-node",
                    "master_nodeid": "mock-master",
                },
            }),
        )
        .await;
        while next_frame(&mut ws).await.is_some() {}
    });

    let (session, mut states) = session_for(port);
    session.connect();

    assert_eq!(expect_state(&mut states).await, SessionState::Online);
    assert!(session.connected());
    assert_eq!(session.session_id(), Some(sessionid));
    assert!(session.store().check_protocol("proto_keep"));

    session.disconnect();
    assert_eq!(expect_state(&mut states).await, SessionState::Offline);
    assert!(!session.connected());

    session.connect();
    assert_eq!(expect_state(&mut states).await, SessionState::Restored);
    assert!(session.restored());
    // The resumed session preserves the node store.
    assert!(session.store().check_protocol("proto_keep"));

    session.shutdown().await;
    server.abort();
}

// After a reconnect that hands out a different session id, the node
// store is reseeded while the registered handlers survive.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_session_id_reseeds_the_store_but_keeps_registries() {
    let (listener, port) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handle_connect(&mut ws, Uuid::new_v4(), false, seed_protocols()).await;
        // Drop the socket out from under the client.
        drop(ws);

        let mut ws = accept(&listener).await;
        let request = next_frame(&mut ws).await.expect("reconnect request");
        send_json(
            &mut ws,
            json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {
                    "session_restored": false,
                    "sessionid": Uuid::new_v4(),
                    "nodeid": "mock-node",
                    "master_nodeid": "mock-master",
                    "protocols": [{
                        "name": "proto_fresh",
                        "default_method_execute_access": 1,
                        "default_channel_broadcast_access": 1,
                        "default_channel_subscribe_access": 1,
                        "providers": [{"nodeid": "other-node", "rank": 1}],
                        "channels": [],
                    }],
                },
            }),
        )
        .await;

        // Exercise the surviving subscription callback.
        send_json(
            &mut ws,
            json!({
                "jsonrpc": "2.0",
                "id": Uuid::new_v4(),
                "method": "blade.broadcast",
                "params": {
                    "protocol": "events_proto",
                    "channel": "events_chan",
                    "event": "ping",
                    "broadcaster_nodeid": "other-node",
                    "params": {"n": 1},
                },
            }),
        )
        .await;
        while next_frame(&mut ws).await.is_some() {}
    });

    let (session, mut states) = session_for(port);
    let (broadcast_tx, mut broadcasts) = mpsc::unbounded_channel();
    session.register_subscription_handler("events_proto", "events_chan", move |rqu| {
        let _ = broadcast_tx.send(rqu.event.clone());
    });
    session.connect();

    assert_eq!(expect_state(&mut states).await, SessionState::Online);
    assert!(session.store().check_protocol("proto_keep"));

    // The server dropped the socket; the monitor flips us offline.
    assert_eq!(expect_state(&mut states).await, SessionState::Offline);

    // Reconnect promptly rather than waiting out the failure backoff.
    session.connect();
    assert_eq!(expect_state(&mut states).await, SessionState::Online);

    // Different session id: reseeded store.
    assert!(!session.store().check_protocol("proto_keep"));
    assert!(session.store().check_protocol("proto_fresh"));

    // The broadcast handler registered before the reconnect still fires.
    let event = timeout(EVENT_WAIT, broadcasts.recv())
        .await
        .expect("timed out waiting for broadcast")
        .unwrap();
    assert_eq!(event, "ping");

    session.shutdown().await;
    server.abort();
}

// A registered protocol method answers an inbound execute; an
// unregistered one gets a manufactured -32601 error.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_execute_dispatches_to_the_registered_handler() {
    let (listener, port) = bind().await;
    let execute_id = Uuid::new_v4();
    let missing_id = Uuid::new_v4();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handle_connect(&mut ws, Uuid::new_v4(), false, json!([])).await;

        send_json(
            &mut ws,
            json!({
                "jsonrpc": "2.0",
                "id": execute_id,
                "method": "blade.execute",
                "params": {
                    "requester_nodeid": "requester",
                    "responder_nodeid": "mock-node",
                    "protocol": "test",
                    "method": "test.method",
                    "params": {"arg": "value"},
                },
            }),
        )
        .await;
        let reply = next_frame(&mut ws).await.expect("execute reply");

        send_json(
            &mut ws,
            json!({
                "jsonrpc": "2.0",
                "id": missing_id,
                "method": "blade.execute",
                "params": {
                    "requester_nodeid": "requester",
                    "responder_nodeid": "mock-node",
                    "protocol": "test",
                    "method": "test.unknown",
                    "params": {},
                },
            }),
        )
        .await;
        let error_reply = next_frame(&mut ws).await.expect("error reply");

        (reply, error_reply)
    });

    let (session, mut states) = session_for(port);
    session.register_protocol_method("test", "test.method", |rqu, cmd| {
        assert_eq!(rqu.params["arg"], "value");
        cmd.set_result(json!({"reply": "i got it!"}))?;
        Ok(())
    });
    session.connect();
    assert_eq!(expect_state(&mut states).await, SessionState::Online);

    let (reply, error_reply) = server.await.unwrap();
    assert_eq!(reply["id"], json!(execute_id));
    assert_eq!(reply["result"]["reply"], "i got it!");

    assert_eq!(error_reply["id"], json!(missing_id));
    assert_eq!(error_reply["error"]["code"], -32601);

    session.shutdown().await;
}

// The connection drops while a handler is still working; the result is
// queued and replayed after the reconnect.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_execute_results_are_replayed_after_reconnect() {
    let (listener, port) = bind().await;
    let execute_id = Uuid::new_v4();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handle_connect(&mut ws, Uuid::new_v4(), false, json!([])).await;
        send_json(
            &mut ws,
            json!({
                "jsonrpc": "2.0",
                "id": execute_id,
                "method": "blade.execute",
                "params": {
                    "requester_nodeid": "requester",
                    "responder_nodeid": "mock-node",
                    "protocol": "test",
                    "method": "test.slow_method",
                    "params": {},
                },
            }),
        )
        .await;
        // Kill the connection while the handler is still running.
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(ws);

        let mut ws = accept(&listener).await;
        let request = next_frame(&mut ws).await.expect("reconnect request");
        send_json(
            &mut ws,
            json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {
                    "session_restored": false,
                    "sessionid": Uuid::new_v4(),
                    "nodeid": "mock-node",
                    "master_nodeid": "mock-master",
                },
            }),
        )
        .await;
        // The replayed result for the interrupted execute.
        next_frame(&mut ws).await.expect("replayed result")
    });

    let (session, mut states) = session_for(port);
    session.register_protocol_method("test", "test.slow_method", |_rqu, cmd| {
        std::thread::sleep(Duration::from_millis(400));
        cmd.set_result(json!({"reply": "slow but done"}))?;
        Ok(())
    });
    session.connect();

    assert_eq!(expect_state(&mut states).await, SessionState::Online);
    assert_eq!(expect_state(&mut states).await, SessionState::Offline);

    // Reconnect promptly; the queued result must drain within its 5s
    // replay window.
    session.connect();

    let replayed = timeout(EVENT_WAIT, server).await.unwrap().unwrap();
    assert_eq!(replayed["id"], json!(execute_id));
    assert_eq!(replayed["result"]["reply"], "slow but done");

    session.shutdown().await;
}

// An auth-rejected connect invokes the auth-failed callback and the
// session keeps retrying until told otherwise.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_credentials_fire_the_auth_failed_callback() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        loop {
            let mut ws = accept(&listener).await;
            if let Some(request) = next_frame(&mut ws).await {
                send_json(
                    &mut ws,
                    json!({
                        "jsonrpc": "2.0",
                        "id": request["id"],
                        "error": {"code": -32002, "message": "authentication failed"},
                    }),
                )
                .await;
            }
        }
    });

    let (session, _states) = session_for(port);
    let (auth_tx, mut auth_rx) = mpsc::unbounded_channel();
    session.on_auth_failed(move || {
        let _ = auth_tx.send(());
    });
    session.connect();

    timeout(EVENT_WAIT, auth_rx.recv())
        .await
        .expect("timed out waiting for the auth-failed callback")
        .unwrap();
    assert!(!session.connected());

    session.shutdown().await;
    server.abort();
}

// Sessions created without any credentials refuse to connect but report
// the failure through retries rather than panicking.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_without_credentials_stays_offline() {
    let (_listener, port) = bind().await;
    let session = Session::new(&format!("ws://127.0.0.1:{port}/api"), Config::default()).unwrap();
    session.connect();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!session.connected());
    session.shutdown().await;
}
