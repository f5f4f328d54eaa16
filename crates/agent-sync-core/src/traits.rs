//! Domain handler trait.

use crate::execution::Execution;
use crate::protocol::{ChatMessage, ServerError, ToolInvocationResult, ToolInvocationStart};

/// Receives the domain effects of inbound events.
///
/// Calls arrive one at a time, in frame receipt order. All methods default
/// to doing nothing so implementors only handle what they render.
pub trait EventSink: Send {
    /// Server greeted the connection.
    fn connection_established(&mut self, _message: Option<&str>) {}

    fn assistant_message(&mut self, _message: &ChatMessage) {}

    /// Message from the secondary agent.
    fn user_agent_message(&mut self, _message: &ChatMessage) {}

    fn tool_invocation_started(&mut self, _invocation: &ToolInvocationStart) {}

    fn tool_invocation_finished(&mut self, _result: &ToolInvocationResult) {}

    /// A code execution began; `code` is the submitted source.
    fn code_execution_started(&mut self, _execution_id: &str, _code: &str) {}

    /// Snapshot taken after the tracker applied a change to this execution.
    fn execution_changed(&mut self, _execution: &Execution) {}

    /// The assistant finished replying.
    fn reply_done(&mut self) {}

    /// Server reported an error.
    fn server_error(&mut self, _error: &ServerError) {}
}

/// Sink that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {}
