//! Dismissible user-facing notices.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Notice identifier.
pub type NoticeId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: NoticeId,
    pub level: NoticeLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Notice {
    #[must_use]
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Option<String>) -> Self {
        self.details = details;
        self
    }
}

/// Notices currently on display.
pub struct NoticeBoard {
    notices: RwLock<Vec<Notice>>,
    sender: broadcast::Sender<Notice>,
}

impl Default for NoticeBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBoard {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            notices: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Show a notice. Returns its id.
    pub fn raise(&self, notice: Notice) -> NoticeId {
        let id = notice.id;
        let _ = self.sender.send(notice.clone());
        self.notices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice);
        id
    }

    /// Remove a notice. Returns `false` if it was not shown.
    pub fn dismiss(&self, id: NoticeId) -> bool {
        let mut notices = self.notices.write().unwrap_or_else(PoisonError::into_inner);
        let before = notices.len();
        notices.retain(|n| n.id != id);
        notices.len() != before
    }

    #[must_use]
    pub fn active(&self) -> Vec<Notice> {
        self.notices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn clear(&self) {
        self.notices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_dismiss() {
        let board = NoticeBoard::new();
        let first = board.raise(Notice::new(NoticeLevel::Info, "hello"));
        let second = board.raise(
            Notice::new(NoticeLevel::Error, "boom").with_details(Some("trace".into())),
        );
        assert_eq!(board.active().len(), 2);

        assert!(board.dismiss(first));
        assert!(!board.dismiss(first));
        let active = board.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second);
        assert_eq!(active[0].details.as_deref(), Some("trace"));
    }

    #[tokio::test]
    async fn broadcasts_raised_notices() {
        let board = NoticeBoard::new();
        let mut rx = board.subscribe();
        board.raise(Notice::new(NoticeLevel::Success, "done"));
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.level, NoticeLevel::Success);
        board.clear();
        assert!(board.active().is_empty());
    }
}
