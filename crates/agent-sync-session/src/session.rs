//! Chat session state driven by the sync client.

use std::sync::{Arc, PoisonError, RwLock};

use agent_sync_core::{
    ChatMessage, EventSink, Execution, ServerError, ToolInvocationResult, ToolInvocationStart,
    UserMessage,
};
use agent_sync_transport::{ClientError, ClientEvent, SyncClient};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::conversation::ConversationEntry;
use crate::feed::ConversationFeed;
use crate::notice::{Notice, NoticeBoard, NoticeId, NoticeLevel};

const SERVER_ERROR_FALLBACK: &str = "Server error occurred";

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No conversation is open")]
    NoConversation,
    #[error("Message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Client(#[from] ClientError),
}

struct Inner {
    feed: ConversationFeed,
    notices: NoticeBoard,
    loading: watch::Sender<bool>,
    executions: broadcast::Sender<Execution>,
    conversation_id: RwLock<Option<String>>,
}

/// Application state for one chat.
///
/// Install a clone as the client's [`EventSink`]; keep another to read
/// state and send messages.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    #[must_use]
    pub fn new() -> Self {
        let (loading, _) = watch::channel(false);
        let (executions, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                feed: ConversationFeed::new(),
                notices: NoticeBoard::new(),
                loading,
                executions,
                conversation_id: RwLock::new(None),
            }),
        }
    }

    /// Make `conversation_id` the target of outgoing messages.
    pub fn open_conversation(&self, conversation_id: impl Into<String>) {
        let id = conversation_id.into();
        info!(conversation_id = %id, "Conversation opened");
        *self
            .inner
            .conversation_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<String> {
        self.inner
            .conversation_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send a chat message in the open conversation.
    ///
    /// The message is shown in the feed and the session waits for a reply.
    /// If the client is not connected the wait is cancelled and an error
    /// notice raised.
    ///
    /// # Errors
    /// Returns error if no conversation is open, the message is blank or the
    /// client could not send it.
    pub async fn send_user_message(
        &self,
        client: &SyncClient,
        content: &str,
        use_dual_agent: Option<bool>,
    ) -> Result<(), SessionError> {
        let conversation_id = self.conversation_id().ok_or(SessionError::NoConversation)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        self.inner.feed.push(ConversationEntry::User {
            content: content.to_string(),
        });
        self.set_loading(true);

        let message = UserMessage {
            conversation_id,
            content: content.to_string(),
            use_dual_agent,
        };
        if let Err(e) = client.send_user_message(&message).await {
            self.set_loading(false);
            self.inner.notices.raise(
                Notice::new(NoticeLevel::Error, "Not connected, message was not sent")
                    .with_details(Some(e.to_string())),
            );
            return Err(e.into());
        }
        Ok(())
    }

    /// Raise notices for connection changes until the client shuts down.
    pub fn track_connection(&self, client: &SyncClient) -> JoinHandle<()> {
        let mut events = client.events();
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::ConnectionLost) => {
                        session.raise(NoticeLevel::Error, "Connection closed", None);
                    }
                    Ok(ClientEvent::ReconnectExhausted { attempts }) => {
                        session.set_loading(false);
                        session.raise(
                            NoticeLevel::Error,
                            "Unable to reconnect to the server",
                            Some(format!("gave up after {attempts} attempts")),
                        );
                    }
                    Ok(
                        ClientEvent::Connected
                        | ClientEvent::Disconnected
                        | ClientEvent::ReconnectScheduled { .. },
                    ) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Connection events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Clear the conversation view and every execution record.
    pub fn clear(&self, client: &SyncClient) {
        self.inner.feed.clear();
        self.inner.notices.clear();
        self.set_loading(false);
        client.clear_executions();
    }

    /// Remove a notice.
    pub fn dismiss(&self, id: NoticeId) -> bool {
        self.inner.notices.dismiss(id)
    }

    #[must_use]
    pub fn feed(&self) -> &ConversationFeed {
        &self.inner.feed
    }

    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.inner.notices.active()
    }

    #[must_use]
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Snapshots of executions as they change.
    #[must_use]
    pub fn execution_updates(&self) -> broadcast::Receiver<Execution> {
        self.inner.executions.subscribe()
    }

    /// Whether a reply is awaited.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        *self.inner.loading.borrow()
    }

    #[must_use]
    pub fn loading(&self) -> watch::Receiver<bool> {
        self.inner.loading.subscribe()
    }

    fn set_loading(&self, loading: bool) {
        self.inner.loading.send_replace(loading);
    }

    fn raise(&self, level: NoticeLevel, message: impl Into<String>, details: Option<String>) {
        self.inner
            .notices
            .raise(Notice::new(level, message).with_details(details));
    }
}

impl EventSink for ChatSession {
    fn connection_established(&mut self, message: Option<&str>) {
        debug!(?message, "Server greeted connection");
        self.raise(NoticeLevel::Info, "Connected to the server", None);
    }

    fn assistant_message(&mut self, message: &ChatMessage) {
        self.inner.feed.push(ConversationEntry::Assistant {
            content: message.content.clone(),
        });
    }

    fn user_agent_message(&mut self, message: &ChatMessage) {
        self.inner.feed.push(ConversationEntry::UserAgent {
            content: message.content.clone(),
        });
    }

    fn tool_invocation_started(&mut self, invocation: &ToolInvocationStart) {
        self.inner.feed.push(ConversationEntry::ToolStart {
            invocation_id: invocation.invocation_id.clone(),
            function: invocation.function.clone(),
            arguments: invocation.arguments.clone(),
        });
    }

    fn tool_invocation_finished(&mut self, result: &ToolInvocationResult) {
        self.inner.feed.push(ConversationEntry::ToolResult {
            invocation_id: result.invocation_id.clone(),
            function: result.function.clone(),
            result: result.result.clone(),
        });
    }

    fn code_execution_started(&mut self, execution_id: &str, code: &str) {
        self.inner.feed.push(ConversationEntry::CodeExecution {
            execution_id: execution_id.to_string(),
            code: code.to_string(),
        });
    }

    fn execution_changed(&mut self, execution: &Execution) {
        let _ = self.inner.executions.send(execution.clone());
    }

    fn reply_done(&mut self) {
        self.set_loading(false);
        self.raise(NoticeLevel::Success, "Reply complete", None);
    }

    fn server_error(&mut self, error: &ServerError) {
        self.set_loading(false);
        let message = if error.message.is_empty() {
            SERVER_ERROR_FALLBACK.to_string()
        } else {
            error.message.clone()
        };
        self.raise(NoticeLevel::Error, message, error.details.clone());
    }
}
