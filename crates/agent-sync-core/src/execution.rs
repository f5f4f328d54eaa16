//! Execution tracking.
//!
//! An [`ExecutionTracker`] owns one [`Execution`] record per server-side code
//! run. Records move `running -> completed | error | cancelled` and the
//! terminal states are absorbing: once an execution leaves `running`, later
//! output, images and status reports for it are ignored.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error message recorded by a local cancellation.
pub const CANCELLED_MESSAGE: &str = "execution cancelled";

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    /// Check if this status is terminal (absorbing).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Map a status string reported by the server.
    ///
    /// Accepts the tool-result spellings (`success`, `failed`) alongside the
    /// canonical names.
    #[must_use]
    pub fn from_report(status: &str) -> Option<Self> {
        match status {
            "running" => Some(Self::Running),
            "completed" | "success" => Some(Self::Completed),
            "error" | "failed" => Some(Self::Error),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an output chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Result,
    Image,
    Other(String),
}

impl From<String> for OutputKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            "result" => Self::Result,
            "image" => Self::Image,
            _ => Self::Other(kind),
        }
    }
}

impl From<OutputKind> for String {
    fn from(kind: OutputKind) -> Self {
        match kind {
            OutputKind::Stdout => "stdout".to_string(),
            OutputKind::Stderr => "stderr".to_string(),
            OutputKind::Result => "result".to_string(),
            OutputKind::Image => "image".to_string(),
            OutputKind::Other(other) => other,
        }
    }
}

/// One chunk of execution output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl OutputItem {
    #[must_use]
    pub fn new(kind: OutputKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn is_image(&self) -> bool {
        self.kind == OutputKind::Image
    }
}

/// An image produced by an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageItem {
    pub format: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

impl ImageItem {
    #[must_use]
    pub fn new(format: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            data: data.into(),
        }
    }

    /// Decode the image bytes.
    ///
    /// # Errors
    /// Returns error if `data` is not valid base64.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.data.trim())
    }
}

/// Client-side view of one server-side code run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub status: ExecutionStatus,
    pub outputs: Vec<OutputItem>,
    pub images: Vec<ImageItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    fn new(id: String) -> Self {
        Self {
            id,
            status: ExecutionStatus::Running,
            outputs: Vec::new(),
            images: Vec::new(),
            error: None,
        }
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Owns every execution record for a session.
///
/// Records are never evicted; [`ExecutionTracker::clear`] is the only way
/// to drop them. Every mutator returns `true` if it changed state.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    executions: IndexMap<String, Execution>,
}

impl ExecutionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an execution in `running` state.
    pub fn create_if_absent(&mut self, id: &str) -> bool {
        if self.executions.contains_key(id) {
            debug!(execution_id = %id, "Execution already tracked");
            return false;
        }
        self.executions
            .insert(id.to_string(), Execution::new(id.to_string()));
        true
    }

    /// Append an output chunk. Image chunks are mirrored into `images`.
    pub fn append_output(&mut self, id: &str, item: OutputItem) -> bool {
        let Some(execution) = self.running_mut(id, "output") else {
            return false;
        };
        if item.is_image() {
            execution
                .images
                .push(ImageItem::new("png", item.content.clone()));
        }
        execution.outputs.push(item);
        true
    }

    /// Append an image directly, bypassing the output log.
    pub fn append_image(&mut self, id: &str, image: ImageItem) -> bool {
        let Some(execution) = self.running_mut(id, "image") else {
            return false;
        };
        execution.images.push(image);
        true
    }

    /// Record a status. Ignored once the execution is terminal.
    pub fn set_status(&mut self, id: &str, status: ExecutionStatus) -> bool {
        let Some(execution) = self.running_mut(id, "status") else {
            return false;
        };
        if execution.status == status {
            return false;
        }
        execution.status = status;
        true
    }

    /// Record an error and move to `error`.
    ///
    /// Another terminal state reached first is kept.
    pub fn set_error(&mut self, id: &str, message: impl Into<String>) -> bool {
        let Some(execution) = self.executions.get_mut(id) else {
            debug!(execution_id = %id, "Ignoring error for unknown execution");
            return false;
        };
        match execution.status {
            ExecutionStatus::Running => {
                execution.status = ExecutionStatus::Error;
                execution.error = Some(message.into());
                true
            }
            ExecutionStatus::Error if execution.error.is_none() => {
                execution.error = Some(message.into());
                true
            }
            status => {
                debug!(execution_id = %id, %status, "Ignoring error for finished execution");
                false
            }
        }
    }

    /// Optimistically mark a running execution as cancelled.
    pub fn cancel(&mut self, id: &str) -> bool {
        let Some(execution) = self.running_mut(id, "cancel") else {
            return false;
        };
        execution.status = ExecutionStatus::Cancelled;
        execution.error = Some(CANCELLED_MESSAGE.to_string());
        true
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Execution> {
        self.executions.get(id)
    }

    /// Executions in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    /// Executions still in `running` state.
    pub fn running(&self) -> impl Iterator<Item = &Execution> {
        self.iter().filter(|e| e.is_running())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.executions.clear();
    }

    fn running_mut(&mut self, id: &str, what: &str) -> Option<&mut Execution> {
        match self.executions.get_mut(id) {
            None => {
                debug!(execution_id = %id, what, "Ignoring update for unknown execution");
                None
            }
            Some(execution) if execution.status.is_terminal() => {
                debug!(
                    execution_id = %id,
                    what,
                    status = %execution.status,
                    "Ignoring update for finished execution"
                );
                None
            }
            Some(execution) => Some(execution),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(id: &str) -> ExecutionTracker {
        let mut tracker = ExecutionTracker::new();
        assert!(tracker.create_if_absent(id));
        tracker
    }

    #[test]
    fn create_is_idempotent() {
        let mut tracker = tracker_with("e1");
        tracker.append_output("e1", OutputItem::new(OutputKind::Stdout, "hi"));
        assert!(!tracker.create_if_absent("e1"));
        let execution = tracker.get("e1").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.outputs.len(), 1);
    }

    #[test]
    fn image_outputs_are_mirrored() {
        let mut tracker = tracker_with("e1");
        assert!(tracker.append_output("e1", OutputItem::new(OutputKind::Image, "X")));
        assert!(tracker.append_output("e1", OutputItem::new(OutputKind::Stdout, "text")));

        let execution = tracker.get("e1").unwrap();
        assert_eq!(execution.outputs.len(), 2);
        assert_eq!(execution.images, vec![ImageItem::new("png", "X")]);
    }

    #[test]
    fn direct_images_skip_outputs() {
        let mut tracker = tracker_with("e1");
        assert!(tracker.append_image("e1", ImageItem::new("jpeg", "AAAA")));
        let execution = tracker.get("e1").unwrap();
        assert!(execution.outputs.is_empty());
        assert_eq!(execution.images.len(), 1);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut tracker = ExecutionTracker::new();
        assert!(!tracker.append_output("nope", OutputItem::new(OutputKind::Stdout, "x")));
        assert!(!tracker.append_image("nope", ImageItem::new("png", "x")));
        assert!(!tracker.set_status("nope", ExecutionStatus::Completed));
        assert!(!tracker.set_error("nope", "boom"));
        assert!(!tracker.cancel("nope"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn terminal_status_is_absorbing() {
        let mut tracker = tracker_with("e1");
        assert!(tracker.set_status("e1", ExecutionStatus::Completed));
        let before = tracker.get("e1").unwrap().clone();

        assert!(!tracker.append_output("e1", OutputItem::new(OutputKind::Stdout, "late")));
        assert!(!tracker.append_image("e1", ImageItem::new("png", "late")));
        assert!(!tracker.set_status("e1", ExecutionStatus::Error));
        assert!(!tracker.set_status("e1", ExecutionStatus::Running));
        assert!(!tracker.set_error("e1", "late"));
        assert!(!tracker.cancel("e1"));

        assert_eq!(tracker.get("e1").unwrap(), &before);
    }

    #[test]
    fn set_error_forces_error_status() {
        let mut tracker = tracker_with("e1");
        assert!(tracker.set_error("e1", "boom"));
        let execution = tracker.get("e1").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert_eq!(execution.error.as_deref(), Some("boom"));

        // first message wins
        assert!(!tracker.set_error("e1", "again"));
        assert_eq!(tracker.get("e1").unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn set_error_fills_message_after_error_status() {
        let mut tracker = tracker_with("e1");
        tracker.set_status("e1", ExecutionStatus::Error);
        assert!(tracker.set_error("e1", "details"));
        assert_eq!(tracker.get("e1").unwrap().error.as_deref(), Some("details"));
    }

    #[test]
    fn cancel_then_late_end_keeps_cancelled() {
        let mut tracker = tracker_with("e1");
        assert!(tracker.cancel("e1"));
        assert!(!tracker.set_status("e1", ExecutionStatus::Completed));

        let execution = tracker.get("e1").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.error.as_deref(), Some(CANCELLED_MESSAGE));
    }

    #[test]
    fn status_aliases() {
        assert_eq!(
            ExecutionStatus::from_report("success"),
            Some(ExecutionStatus::Completed)
        );
        assert_eq!(
            ExecutionStatus::from_report("failed"),
            Some(ExecutionStatus::Error)
        );
        assert_eq!(
            ExecutionStatus::from_report("cancelled"),
            Some(ExecutionStatus::Cancelled)
        );
        assert_eq!(ExecutionStatus::from_report("queued"), None);
    }

    #[test]
    fn output_kind_round_trips_unknown_names() {
        let item: OutputItem =
            serde_json::from_value(serde_json::json!({"type": "html", "content": "<b>"})).unwrap();
        assert_eq!(item.kind, OutputKind::Other("html".into()));
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "html");
    }

    #[test]
    fn image_decode() {
        assert_eq!(ImageItem::new("png", "aGk=").decode().unwrap(), b"hi");
        assert!(ImageItem::new("png", "***").decode().is_err());
    }

    #[test]
    fn clear_drops_everything() {
        let mut tracker = tracker_with("e1");
        tracker.create_if_absent("e2");
        tracker.set_status("e2", ExecutionStatus::Completed);
        assert_eq!(tracker.running().count(), 1);
        tracker.clear();
        assert!(tracker.is_empty());
        assert!(tracker.get("e1").is_none());
    }
}
