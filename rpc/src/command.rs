// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! One in-flight or completed JSON-RPC 2.0 exchange.
//!
//! A [`Command`] is born as a request (either built locally or synthesized
//! from an inbound frame) and makes exactly one terminal transition to
//! result, error or failure. Once terminal, no further writes are accepted.

use crate::{Error, ErrorObject, DEFAULT_COMMAND_TTL_MS, RESPONSE_WAIT_GRACE_MS};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Flags controlling aspects of a command, e.g. whether a reply is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandFlags(u32);

impl CommandFlags {
    /// No flags set; a reply is expected and will be tracked.
    pub const NONE: CommandFlags = CommandFlags(0);
    /// The upstream will not reply to this command.
    pub const NOREPLY: CommandFlags = CommandFlags(1);

    pub fn contains(self, other: CommandFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CommandFlags {
    type Output = CommandFlags;
    fn bitor(self, rhs: CommandFlags) -> CommandFlags {
        CommandFlags(self.0 | rhs.0)
    }
}

/// Why a command completed without a reply from the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStatus {
    /// The TTL expired before a reply arrived.
    Timeout,
    /// The caller cancelled the request.
    Cancelled,
    /// The connection went down before a reply arrived.
    Disconnected,
    /// The reply arrived but did not parse as a JSON-RPC envelope.
    ParseError,
    /// The TTL tracker was at capacity, the submit was refused locally.
    Capacity,
}

/// The state a command is in; request is the only non-terminal state.
#[derive(Debug, Clone)]
enum CommandState {
    Request(Value),
    Result(Value),
    Error(Value),
    Failure {
        status: FailureStatus,
        reason: String,
    },
}

/// An immutable snapshot of a command's terminal state, delivered to the
/// waiter exactly once.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The upstream replied with a `result` payload.
    Result(Value),
    /// The upstream replied with an `error` payload.
    Error(Value),
    /// No reply; the failure explains why (timeout, disconnect, ...).
    Failure {
        status: FailureStatus,
        reason: String,
    },
}

impl Reply {
    /// Ok if the reply is a result; errors map onto [`Error::Rpc`] and
    /// [`Error::Failure`] respectively.
    pub fn ok(&self) -> Result<(), Error> {
        match self {
            Reply::Result(_) => Ok(()),
            Reply::Error(error) => Err(Error::Rpc(error_object(error))),
            Reply::Failure { status, reason } => Err(Error::Failure {
                status: *status,
                reason: reason.clone(),
            }),
        }
    }

    /// Deserialize the result payload, or fail the same way [`Reply::ok`]
    /// does when the reply is not a result.
    pub fn result<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match self {
            Reply::Result(json) => Ok(serde_json::from_value(json.clone())?),
            _ => {
                self.ok()?;
                unreachable!("non-result replies error out above")
            }
        }
    }

    /// The JSON payload for result and error replies.
    pub fn json(&self) -> Option<&Value> {
        match self {
            Reply::Result(json) | Reply::Error(json) => Some(json),
            Reply::Failure { .. } => None,
        }
    }

    /// The decoded JSON-RPC error object, when this reply is an error.
    pub fn error_object(&self) -> Option<ErrorObject> {
        match self {
            Reply::Error(error) => Some(error_object(error)),
            _ => None,
        }
    }
}

fn error_object(error: &Value) -> ErrorObject {
    serde_json::from_value(error.clone()).unwrap_or(ErrorObject {
        code: 0,
        message: error.to_string(),
    })
}

/// A one-shot handle to the reply of a submitted command.
///
/// The wait deadline is the command's TTL plus a small grace, enough for
/// the TTL tracker to have delivered a timeout failure first in the normal
/// case. A waiter that gives up SHOULD cancel the request on the
/// connection so the pending entry is released.
#[derive(Debug)]
pub struct ResponseFuture {
    id: Uuid,
    deadline: Duration,
    rx: oneshot::Receiver<Reply>,
}

impl ResponseFuture {
    pub(crate) fn new(id: Uuid, ttl: Duration, rx: oneshot::Receiver<Reply>) -> ResponseFuture {
        ResponseFuture {
            id,
            deadline: ttl + Duration::from_millis(RESPONSE_WAIT_GRACE_MS),
            rx,
        }
    }

    /// The id of the command this future is bound to.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the reply, up to TTL + grace.
    pub async fn wait(self) -> Result<Reply, Error> {
        match tokio::time::timeout(self.deadline, self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Dropped),
            Err(_) => Err(Error::Failure {
                status: FailureStatus::Timeout,
                reason: format!("timed out waiting for reply to command {}", self.id),
            }),
        }
    }
}

/// A JSON-RPC 2.0 exchange: id, method, request payload and (eventually)
/// one terminal outcome.
#[derive(Debug, Clone)]
pub struct Command {
    id: Uuid,
    method: String,
    flags: CommandFlags,
    response_ttl: Duration,
    state: CommandState,
}

impl Command {
    /// Build a request command with a fresh id and the default TTL.
    pub fn request(method: impl Into<String>, params: &impl Serialize) -> Result<Command, Error> {
        Ok(Command {
            id: Uuid::new_v4(),
            method: method.into(),
            flags: CommandFlags::NONE,
            response_ttl: Duration::from_millis(DEFAULT_COMMAND_TTL_MS),
            state: CommandState::Request(serde_json::to_value(params)?),
        })
    }

    /// Synthesize a request command from an inbound frame. The id echoes
    /// the frame so a result set on this command replies to the requester.
    pub fn from_inbound(id: Uuid, method: impl Into<String>, params: Value) -> Command {
        Command {
            id,
            method: method.into(),
            flags: CommandFlags::NONE,
            response_ttl: Duration::from_millis(DEFAULT_COMMAND_TTL_MS),
            state: CommandState::Request(params),
        }
    }

    /// Replace the generated id; used when the caller correlates externally.
    pub fn with_id(mut self, id: Uuid) -> Command {
        self.id = id;
        self
    }

    pub fn with_flags(mut self, flags: CommandFlags) -> Command {
        self.flags = flags;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Command {
        self.response_ttl = ttl;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    pub fn response_ttl(&self) -> Duration {
        self.response_ttl
    }

    /// Whether submitting this command should register it for a reply.
    pub fn expects_reply(&self) -> bool {
        matches!(self.state, CommandState::Request(_)) && !self.flags.contains(CommandFlags::NOREPLY)
    }

    /// True once the command made its terminal transition.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, CommandState::Request(_))
    }

    pub fn is_result(&self) -> bool {
        matches!(self.state, CommandState::Result(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.state, CommandState::Error(_))
    }

    /// The request params, while the command is still a request.
    pub fn params(&self) -> Option<&Value> {
        match &self.state {
            CommandState::Request(params) => Some(params),
            _ => None,
        }
    }

    /// Deserialize the request params into a typed record.
    pub fn parse_request<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match &self.state {
            CommandState::Request(params) => Ok(serde_json::from_value(params.clone())?),
            _ => Err(Error::InvalidCommandState("not a request")),
        }
    }

    fn terminal(&mut self, next: CommandState) -> Result<(), Error> {
        if self.is_terminal() {
            return Err(Error::InvalidCommandState("command already completed"));
        }
        self.state = next;
        Ok(())
    }

    /// Transition to result; terminal.
    pub fn set_result(&mut self, result: Value) -> Result<(), Error> {
        self.terminal(CommandState::Result(result))
    }

    /// Transition to error; terminal.
    pub fn set_error(&mut self, error: Value) -> Result<(), Error> {
        self.terminal(CommandState::Error(error))
    }

    /// Transition to failure; terminal.
    pub fn report_failure(
        &mut self,
        status: FailureStatus,
        reason: impl Into<String>,
    ) -> Result<(), Error> {
        self.terminal(CommandState::Failure {
            status,
            reason: reason.into(),
        })
    }

    /// The terminal state as a reply snapshot, if the command is terminal.
    pub fn reply(&self) -> Option<Reply> {
        match &self.state {
            CommandState::Request(_) => None,
            CommandState::Result(json) => Some(Reply::Result(json.clone())),
            CommandState::Error(json) => Some(Reply::Error(json.clone())),
            CommandState::Failure { status, reason } => Some(Reply::Failure {
                status: *status,
                reason: reason.clone(),
            }),
        }
    }

    /// Render the wire envelope for this command. Requests render a
    /// `method`/`params` envelope; results and errors echo the id with the
    /// matching member. Failures are local-only and cannot be rendered.
    pub fn render(&self) -> Result<String, Error> {
        let envelope = match &self.state {
            CommandState::Request(params) => serde_json::json!({
                "jsonrpc": "2.0",
                "id": self.id,
                "method": self.method,
                "params": params,
            }),
            CommandState::Result(result) => serde_json::json!({
                "jsonrpc": "2.0",
                "id": self.id,
                "result": result,
            }),
            CommandState::Error(error) => serde_json::json!({
                "jsonrpc": "2.0",
                "id": self.id,
                "error": error,
            }),
            CommandState::Failure { .. } => {
                return Err(Error::InvalidCommandState("failures have no wire form"));
            }
        };
        Ok(envelope.to_string())
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            CommandState::Request(_) => "request",
            CommandState::Result(_) => "result",
            CommandState::Error(_) => "error",
            CommandState::Failure { .. } => "failure",
        };
        write!(
            f,
            "{} id: {} state: {} ttl: {}ms",
            self.method,
            self.id,
            state,
            self.response_ttl.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RpcFrame;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn terminal_transition_is_single_shot() {
        let mut cmd = Command::from_inbound(Uuid::new_v4(), "test.method", json!({}));
        cmd.set_result(json!({"ok": true})).unwrap();
        assert!(cmd.is_terminal());
        assert_matches!(
            cmd.set_error(json!({"code": -1})),
            Err(Error::InvalidCommandState(_))
        );
        assert_matches!(
            cmd.report_failure(FailureStatus::Timeout, "nope"),
            Err(Error::InvalidCommandState(_))
        );
    }

    #[test]
    fn noreply_requests_are_not_tracked() {
        let cmd = Command::request("blade.broadcast", &json!({"x": 1}))
            .unwrap()
            .with_flags(CommandFlags::NOREPLY);
        assert!(!cmd.expects_reply());

        let cmd = Command::request("blade.execute", &json!({"x": 1})).unwrap();
        assert!(cmd.expects_reply());
    }

    #[test]
    fn request_envelope_round_trips() {
        let params = json!({"protocol": "test", "channel": "chan"});
        let cmd = Command::request("blade.subscription", &params).unwrap();
        let rendered = cmd.render().unwrap();

        let frame: RpcFrame = rendered.parse().unwrap();
        let RpcFrame::Request { id, method, params: parsed } = frame else {
            panic!("request rendered as something else");
        };
        assert_eq!(id, cmd.id());
        assert_eq!(method, "blade.subscription");
        let parsed: Value = serde_json::from_str(parsed.get()).unwrap();
        assert_eq!(parsed, params);

        // Rendering the re-synthesized command yields the same envelope.
        let again = Command::from_inbound(id, method, parsed).render().unwrap();
        let a: Value = serde_json::from_str(&rendered).unwrap();
        let b: Value = serde_json::from_str(&again).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn result_and_error_envelopes_round_trip() {
        let mut cmd = Command::from_inbound(Uuid::new_v4(), "test.method", json!({}));
        cmd.set_result(json!({"reply": "i got it!"})).unwrap();
        let frame: RpcFrame = cmd.render().unwrap().parse().unwrap();
        assert_matches!(frame, RpcFrame::Result { id, .. } if id == cmd.id());

        let mut cmd = Command::from_inbound(Uuid::new_v4(), "test.method", json!({}));
        cmd.set_error(json!({"code": -32601, "message": "nope"}))
            .unwrap();
        let frame: RpcFrame = cmd.render().unwrap().parse().unwrap();
        assert_matches!(frame, RpcFrame::Error { id, .. } if id == cmd.id());
    }

    #[tokio::test]
    async fn future_times_out_after_ttl_plus_grace() {
        tokio::time::pause();
        let (_tx, rx) = oneshot::channel();
        let future = ResponseFuture::new(Uuid::new_v4(), Duration::from_millis(10), rx);
        let wait = tokio::spawn(future.wait());
        tokio::time::advance(Duration::from_millis(10 + RESPONSE_WAIT_GRACE_MS + 1)).await;
        let result = wait.await.unwrap();
        assert_matches!(
            result,
            Err(Error::Failure {
                status: FailureStatus::Timeout,
                ..
            })
        );
    }
}
