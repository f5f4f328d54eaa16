//! Inbound message routing.
//!
//! Every frame goes to the subscription registry first. Frames whose type is
//! one of the domain events are then applied to the execution tracker and
//! handed to the application's [`EventSink`].

use std::sync::{Arc, PoisonError, RwLock};

use agent_sync_core::{
    DomainEvent, Envelope, EventSink, ExecutionStatus, ExecutionTracker, ImageItem, ProtocolError,
};
use tracing::{debug, warn};

use crate::registry::SubscriptionRegistry;

/// Execution tracker shared between the event loop and the client handles.
pub type SharedTracker = Arc<RwLock<ExecutionTracker>>;

pub struct MessageRouter {
    tracker: SharedTracker,
    sink: Box<dyn EventSink>,
    code_tool: String,
}

impl MessageRouter {
    pub fn new(tracker: SharedTracker, sink: Box<dyn EventSink>, code_tool: impl Into<String>) -> Self {
        Self {
            tracker,
            sink,
            code_tool: code_tool.into(),
        }
    }

    /// Route one inbound frame.
    ///
    /// # Errors
    /// Returns error if the frame is malformed (nothing was dispatched) or a
    /// domain payload does not decode (topic handlers already ran).
    pub fn route(&mut self, registry: &SubscriptionRegistry, frame: &str) -> Result<(), ProtocolError> {
        let envelope = Envelope::parse(frame)?;
        let delivered = registry.dispatch(&envelope.kind, &envelope.data);
        if let Some(event) = DomainEvent::from_envelope(&envelope)? {
            self.apply(event);
        } else if delivered == 0 {
            debug!(kind = %envelope.kind, "Ignoring unhandled event");
        }
        Ok(())
    }

    /// Optimistically cancel an execution.
    pub fn cancel_execution(&mut self, execution_id: &str) -> bool {
        self.update(execution_id, |tracker| tracker.cancel(execution_id))
    }

    fn apply(&mut self, event: DomainEvent) {
        match event {
            DomainEvent::ConnectionEstablished(notice) => {
                self.sink.connection_established(notice.message.as_deref());
            }
            DomainEvent::AssistantMessage(message) => self.sink.assistant_message(&message),
            DomainEvent::UserAgentMessage(message) => self.sink.user_agent_message(&message),
            DomainEvent::ToolInvocationStart(invocation) => {
                self.sink.tool_invocation_started(&invocation);
                if invocation.function == self.code_tool {
                    let id = invocation.invocation_id.as_str();
                    self.update(id, |tracker| tracker.create_if_absent(id));
                }
            }
            DomainEvent::ToolInvocationResult(result) => {
                self.sink.tool_invocation_finished(&result);
                if result.function == self.code_tool {
                    let id = result.invocation_id.as_str();
                    let status = result.status().and_then(|s| {
                        let status = ExecutionStatus::from_report(s);
                        if status.is_none() {
                            debug!(execution_id = %id, status = s, "Unknown tool result status");
                        }
                        status
                    });
                    let error = result.error();
                    self.update(id, |tracker| {
                        let status_applied = status.is_some_and(|s| tracker.set_status(id, s));
                        let error_applied = error.is_some_and(|e| tracker.set_error(id, e));
                        status_applied || error_applied
                    });
                }
            }
            DomainEvent::CodeExecutionStart { execution_id, code } => {
                let created = self.update(&execution_id, |tracker| tracker.create_if_absent(&execution_id));
                if created {
                    self.sink.code_execution_started(&execution_id, &code);
                }
            }
            DomainEvent::CodeExecutionOutput {
                execution_id,
                output,
            } => {
                self.update(&execution_id, |tracker| tracker.append_output(&execution_id, output));
            }
            DomainEvent::CodeExecutionImage {
                execution_id,
                format,
                data,
            } => {
                let image = ImageItem::new(format, data);
                self.update(&execution_id, |tracker| tracker.append_image(&execution_id, image));
            }
            DomainEvent::CodeExecutionEnd {
                execution_id,
                status,
            } => match ExecutionStatus::from_report(&status) {
                Some(status) => {
                    self.update(&execution_id, |tracker| tracker.set_status(&execution_id, status));
                }
                None => warn!(%execution_id, %status, "Unknown execution end status"),
            },
            DomainEvent::Done => self.sink.reply_done(),
            DomainEvent::Error(error) => {
                warn!(message = %error.message, "Server reported error");
                self.sink.server_error(&error);
            }
        }
    }

    /// Apply a tracker mutation; on change, hand the sink a snapshot.
    fn update<F>(&mut self, execution_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut ExecutionTracker) -> bool,
    {
        let snapshot = {
            let mut tracker = self.tracker.write().unwrap_or_else(PoisonError::into_inner);
            if !mutate(&mut tracker) {
                return false;
            }
            tracker.get(execution_id).cloned()
        };
        if let Some(execution) = snapshot {
            self.sink.execution_changed(&execution);
        }
        true
    }
}
