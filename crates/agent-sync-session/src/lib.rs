//! Chat session state on top of the sync client.
//!
//! Provides:
//! - `ChatSession` - Event sink holding the conversation feed, loading flag and notices
//! - `ConversationFeed` - History plus live stream of conversation entries
//! - `NoticeBoard` - Dismissible user-facing notices

pub mod conversation;
pub mod feed;
pub mod notice;
pub mod session;

pub use conversation::ConversationEntry;
pub use feed::ConversationFeed;
pub use notice::{Notice, NoticeBoard, NoticeId, NoticeLevel};
pub use session::{ChatSession, SessionError};
