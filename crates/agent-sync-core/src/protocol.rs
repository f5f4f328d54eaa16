//! Wire protocol for client-server communication.
//!
//! Every frame in either direction is one JSON [`Envelope`]:
//! `{"type": "<name>", "data": {...}}`. The shape of `data` is determined by
//! `type`; [`DomainEvent`] is the typed view of the inbound types the router
//! acts on.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::execution::OutputItem;

/// Prefix of execution-scoped topics (`execution_<id>`).
pub const EXECUTION_TOPIC_PREFIX: &str = "execution_";

/// Build the execution-scoped topic for an execution id.
#[must_use]
pub fn execution_topic(execution_id: &str) -> String {
    format!("{EXECUTION_TOPIC_PREFIX}{execution_id}")
}

/// Error decoding an inbound frame or payload.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed frame: envelope type is empty")]
    EmptyType,
    #[error("Invalid payload for '{kind}': {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// The only wire unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event or control type. Never empty.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload, shaped by `kind`.
    #[serde(default = "empty_object")]
    pub data: Value,
}

impl Envelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Decode one text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a JSON envelope or its type is empty.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let mut envelope: Self = serde_json::from_str(frame)?;
        if envelope.kind.trim().is_empty() {
            return Err(ProtocolError::EmptyType);
        }
        if envelope.data.is_null() {
            envelope.data = empty_object();
        }
        Ok(envelope)
    }

    /// Encode as one text frame.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// `{"type":"subscribe","data":{"topic":...}}`
    #[must_use]
    pub fn subscribe(topic: &str) -> Self {
        Self::new("subscribe", json!({ "topic": topic }))
    }

    /// `{"type":"unsubscribe","data":{"topic":...}}`
    #[must_use]
    pub fn unsubscribe(topic: &str) -> Self {
        Self::new("unsubscribe", json!({ "topic": topic }))
    }

    /// Chat message from the user.
    #[must_use]
    pub fn user_message(message: &UserMessage) -> Self {
        Self::new(
            "user_message",
            serde_json::to_value(message).unwrap_or_else(|_| empty_object()),
        )
    }

    /// Ask the server to stream an execution's events to this connection.
    #[must_use]
    pub fn subscribe_execution(execution_id: &str) -> Self {
        Self::new(
            "subscribe_execution",
            json!({ "execution_id": execution_id }),
        )
    }

    /// Ask the server to cancel a running execution.
    #[must_use]
    pub fn cancel_execution(execution_id: &str) -> Self {
        Self::new("cancel_execution", json!({ "execution_id": execution_id }))
    }

    /// `data.execution_id`, if present as a string or number.
    #[must_use]
    pub fn execution_id(&self) -> Option<String> {
        execution_id_of(&self.data)
    }
}

/// Extract `execution_id` from a payload.
#[must_use]
pub fn execution_id_of(data: &Value) -> Option<String> {
    match data.get("execution_id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn default_image_format() -> String {
    "png".to_string()
}

/// Outbound chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub conversation_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_dual_agent: Option<bool>,
}

/// `connection_established` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionNotice {
    #[serde(default)]
    pub message: Option<String>,
}

/// `assistant_message` / `user_agent_message` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub content: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// `tool_invocation_start` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolInvocationStart {
    #[serde(deserialize_with = "id_string")]
    pub invocation_id: String,
    pub function: String,
    #[serde(default)]
    pub arguments: Value,
}

/// `tool_invocation_result` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolInvocationResult {
    #[serde(deserialize_with = "id_string")]
    pub invocation_id: String,
    pub function: String,
    #[serde(default)]
    pub result: Value,
}

impl ToolInvocationResult {
    /// `result.status`, when the tool reports one.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.result.get("status").and_then(Value::as_str)
    }

    /// `result.error`, when present and non-empty.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.result
            .get("error")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
    }
}

/// `error` payload reported by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerError {
    #[serde(default = "default_server_error")]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

fn default_server_error() -> String {
    "Server error occurred".to_string()
}

#[derive(Deserialize)]
struct ExecutionStartPayload {
    #[serde(deserialize_with = "id_string")]
    execution_id: String,
    #[serde(default)]
    code: String,
}

#[derive(Deserialize)]
struct ExecutionOutputPayload {
    #[serde(deserialize_with = "id_string")]
    execution_id: String,
    output: OutputItem,
}

#[derive(Deserialize)]
struct ExecutionImagePayload {
    #[serde(deserialize_with = "id_string")]
    execution_id: String,
    #[serde(default = "default_image_format")]
    image_format: String,
    image_data: String,
}

#[derive(Deserialize)]
struct ExecutionEndPayload {
    #[serde(deserialize_with = "id_string")]
    execution_id: String,
    status: String,
}

/// The closed set of inbound events with domain handlers.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    ConnectionEstablished(ConnectionNotice),
    AssistantMessage(ChatMessage),
    UserAgentMessage(ChatMessage),
    ToolInvocationStart(ToolInvocationStart),
    ToolInvocationResult(ToolInvocationResult),
    CodeExecutionStart {
        execution_id: String,
        code: String,
    },
    CodeExecutionOutput {
        execution_id: String,
        output: OutputItem,
    },
    CodeExecutionImage {
        execution_id: String,
        format: String,
        data: String,
    },
    CodeExecutionEnd {
        execution_id: String,
        status: String,
    },
    Done,
    Error(ServerError),
}

impl DomainEvent {
    /// Decode the typed event for an envelope.
    ///
    /// Returns `Ok(None)` for types outside the domain set.
    ///
    /// # Errors
    /// Returns error if the type is known but its payload does not match.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, ProtocolError> {
        let kind = envelope.kind.as_str();
        let event = match kind {
            "connection_established" => Self::ConnectionEstablished(payload(envelope)?),
            "assistant_message" => Self::AssistantMessage(payload(envelope)?),
            "user_agent_message" => Self::UserAgentMessage(payload(envelope)?),
            "tool_invocation_start" => Self::ToolInvocationStart(payload(envelope)?),
            "tool_invocation_result" => Self::ToolInvocationResult(payload(envelope)?),
            "code_execution_start" => {
                let p: ExecutionStartPayload = payload(envelope)?;
                Self::CodeExecutionStart {
                    execution_id: p.execution_id,
                    code: p.code,
                }
            }
            "code_execution_output" => {
                let p: ExecutionOutputPayload = payload(envelope)?;
                Self::CodeExecutionOutput {
                    execution_id: p.execution_id,
                    output: p.output,
                }
            }
            "code_execution_image" => {
                let p: ExecutionImagePayload = payload(envelope)?;
                Self::CodeExecutionImage {
                    execution_id: p.execution_id,
                    format: p.image_format,
                    data: p.image_data,
                }
            }
            "code_execution_end" => {
                let p: ExecutionEndPayload = payload(envelope)?;
                Self::CodeExecutionEnd {
                    execution_id: p.execution_id,
                    status: p.status,
                }
            }
            "done" => Self::Done,
            "error" => Self::Error(payload(envelope)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn payload<T: for<'de> Deserialize<'de>>(envelope: &Envelope) -> Result<T, ProtocolError> {
    T::deserialize(&envelope.data).map_err(|source| ProtocolError::InvalidPayload {
        kind: envelope.kind.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn parse_defaults_missing_data_to_empty_object() {
        let envelope = assert_ok!(Envelope::parse(r#"{"type":"done"}"#));
        assert_eq!(envelope.kind, "done");
        assert_eq!(envelope.data, json!({}));

        let envelope = assert_ok!(Envelope::parse(r#"{"type":"done","data":null}"#));
        assert_eq!(envelope.data, json!({}));
    }

    #[test]
    fn parse_rejects_malformed_frames() {
        assert_err!(Envelope::parse("not json"));
        assert_err!(Envelope::parse(r#"{"data":{}}"#));
        assert!(matches!(
            Envelope::parse(r#"{"type":"  ","data":{}}"#),
            Err(ProtocolError::EmptyType)
        ));
    }

    #[test]
    fn control_frames_match_wire_format() {
        let frame = assert_ok!(Envelope::subscribe("execution_e1").to_frame());
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "subscribe", "data": {"topic": "execution_e1"}})
        );

        let message = UserMessage {
            conversation_id: "c1".into(),
            content: "hi".into(),
            use_dual_agent: None,
        };
        let envelope = Envelope::user_message(&message);
        assert_eq!(envelope.kind, "user_message");
        assert_eq!(envelope.data, json!({"conversation_id": "c1", "content": "hi"}));

        let envelope = Envelope::cancel_execution("e9");
        assert_eq!(envelope.data, json!({"execution_id": "e9"}));
    }

    #[test]
    fn execution_id_accepts_strings_and_numbers() {
        let envelope = Envelope::new("x", json!({"execution_id": "e1"}));
        assert_eq!(envelope.execution_id().as_deref(), Some("e1"));
        let envelope = Envelope::new("x", json!({"execution_id": 42}));
        assert_eq!(envelope.execution_id().as_deref(), Some("42"));
        let envelope = Envelope::new("x", json!({}));
        assert_eq!(envelope.execution_id(), None);
    }

    #[test]
    fn decodes_execution_events() {
        let envelope = Envelope::new(
            "code_execution_output",
            json!({"execution_id": "e1", "output": {"type": "image", "content": "X"}}),
        );
        let event = assert_ok!(DomainEvent::from_envelope(&envelope));
        match event {
            Some(DomainEvent::CodeExecutionOutput {
                execution_id,
                output,
            }) => {
                assert_eq!(execution_id, "e1");
                assert!(output.is_image());
                assert_eq!(output.content, "X");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let envelope = Envelope::new(
            "code_execution_image",
            json!({"execution_id": "e1", "image_data": "AAAA"}),
        );
        match assert_ok!(DomainEvent::from_envelope(&envelope)) {
            Some(DomainEvent::CodeExecutionImage { format, data, .. }) => {
                assert_eq!(format, "png");
                assert_eq!(data, "AAAA");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_types_are_not_domain_events() {
        let envelope = Envelope::new("subscription_confirmed", json!({"topic": "t"}));
        assert!(assert_ok!(DomainEvent::from_envelope(&envelope)).is_none());
    }

    #[test]
    fn known_type_with_bad_payload_is_an_error() {
        let envelope = Envelope::new("code_execution_end", json!({"execution_id": "e1"}));
        let err = assert_err!(DomainEvent::from_envelope(&envelope));
        assert!(err.to_string().contains("code_execution_end"));
    }

    #[test]
    fn tool_result_accessors() {
        let envelope = Envelope::new(
            "tool_invocation_result",
            json!({
                "invocation_id": "t1",
                "function": "exec_code",
                "result": {"status": "error", "error": "boom"}
            }),
        );
        match assert_ok!(DomainEvent::from_envelope(&envelope)) {
            Some(DomainEvent::ToolInvocationResult(result)) => {
                assert_eq!(result.status(), Some("error"));
                assert_eq!(result.error(), Some("boom"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn server_error_defaults_message() {
        let envelope = Envelope::new("error", json!({"details": "trace"}));
        match assert_ok!(DomainEvent::from_envelope(&envelope)) {
            Some(DomainEvent::Error(error)) => {
                assert_eq!(error.message, "Server error occurred");
                assert_eq!(error.details.as_deref(), Some("trace"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
