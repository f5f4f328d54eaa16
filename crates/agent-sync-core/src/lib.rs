//! Core building blocks for the agent chat sync layer.
//!
//! This crate provides:
//! - `Envelope` - The `{type, data}` wire unit and its control frames
//! - `DomainEvent` - Typed view of the fixed set of domain event envelopes
//! - `ExecutionTracker` - Per-execution status, ordered output and images
//! - `EventSink` - Trait the application implements to receive domain events

pub mod execution;
pub mod protocol;
pub mod traits;

pub use execution::{
    Execution, ExecutionStatus, ExecutionTracker, ImageItem, OutputItem, OutputKind,
};
pub use protocol::{
    ChatMessage, DomainEvent, Envelope, ProtocolError, ServerError, ToolInvocationResult,
    ToolInvocationStart, UserMessage, execution_topic,
};
pub use traits::{EventSink, NoopSink};
