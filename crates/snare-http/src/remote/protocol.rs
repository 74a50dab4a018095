//! Control protocol messages.
//!
//! Newline-delimited JSON over TCP. The client sends [`ClientMessage`]s, each
//! answered by exactly one [`HostMessage::Response`] with the same id. The host
//! also pushes events and callback requests at any time. Every pushed event
//! carries a delivery id which the client echoes back in an `eventAck` once its
//! local subscribers have run; the host holds the intercepted exchange until
//! then.

use crate::capture::{CompletedRequest, Protocol};
use crate::config::ServerConfig;
use crate::events::{Event, EventKind, SubscriptionHandle};
use crate::rules::{Reply, RuleData, RuleHandle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub id: u64,
    pub command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<ServerConfig>,
    },
    Stop,
    AddRule {
        rule: RuleData,
    },
    RemoveRule {
        handle: RuleHandle,
    },
    Reset,
    #[serde(rename_all = "camelCase")]
    Subscribe {
        subscription_id: String,
        kind: EventKind,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
    },
    #[serde(rename_all = "camelCase")]
    CallbackResult {
        invocation_id: String,
        result: CallbackOutcome,
    },
    #[serde(rename_all = "camelCase")]
    EventAck {
        delivery_id: String,
    },
}

/// Result of a remotely executed rule callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallbackOutcome {
    Reply(Reply),
    Error(String),
}

/// Result of a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Ok(Value),
    Err(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Response {
        id: u64,
        result: Outcome,
    },
    #[serde(rename_all = "camelCase")]
    Event {
        subscription_id: String,
        delivery_id: String,
        event: Event,
    },
    #[serde(rename_all = "camelCase")]
    CallbackRequest {
        callback_id: String,
        invocation_id: String,
        request: Arc<CompletedRequest>,
    },
}

/// Reply to a successful `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Started {
    pub port: u16,
    pub protocol: Protocol,
}

/// Encode a message as one protocol line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_shape() {
        let msg = ClientMessage {
            id: 7,
            command: Command::Subscribe {
                subscription_id: "s-1".to_string(),
                kind: EventKind::Response,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"id": 7, "command": {"type": "subscribe", "subscriptionId": "s-1", "kind": "response"}})
        );

        let stop: ClientMessage =
            serde_json::from_value(json!({"id": 1, "command": {"type": "stop"}})).unwrap();
        assert!(matches!(stop.command, Command::Stop));

        let start: ClientMessage =
            serde_json::from_value(json!({"id": 2, "command": {"type": "start"}})).unwrap();
        assert!(matches!(start.command, Command::Start { config: None }));
    }

    #[test]
    fn test_host_message_wire_shape() {
        let msg = HostMessage::Response {
            id: 3,
            result: Outcome::Err("Server is not running".to_string()),
        };
        let line = encode_line(&msg).unwrap();
        assert!(line.ends_with('\n'));
        let json: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["result"]["err"], "Server is not running");
    }

    #[test]
    fn test_callback_result_wire_shape() {
        let msg = ClientMessage {
            id: 9,
            command: Command::CallbackResult {
                invocation_id: "inv".to_string(),
                result: CallbackOutcome::Reply(Reply::new(201).with_body("made")),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["command"]["invocationId"], "inv");
        assert_eq!(json["command"]["result"]["reply"]["status"], 201);

        let back: ClientMessage = serde_json::from_value(json).unwrap();
        let Command::CallbackResult { result, .. } = back.command else {
            panic!("expected callback result");
        };
        assert_eq!(result, CallbackOutcome::Reply(Reply::new(201).with_body("made")));
    }

    #[test]
    fn test_event_ack_wire_shape() {
        let ack: ClientMessage = serde_json::from_value(
            json!({"id": 4, "command": {"type": "eventAck", "deliveryId": "d-1"}}),
        )
        .unwrap();
        assert!(matches!(ack.command, Command::EventAck { ref delivery_id } if delivery_id == "d-1"));
    }
}
