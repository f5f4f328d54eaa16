//! Broadcast + history feed of conversation entries.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::conversation::ConversationEntry;

/// Default history size limit (16 MB).
const HISTORY_BYTES: usize = 16 * 1024 * 1024;

const CHANNEL_CAPACITY: usize = 1024;

struct StoredEntry {
    entry: ConversationEntry,
    bytes: usize,
}

#[derive(Default)]
struct Inner {
    history: VecDeque<StoredEntry>,
    total_bytes: usize,
}

/// Conversation feed with broadcast and history.
///
/// Late subscribers get the history first, then live entries.
pub struct ConversationFeed {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<ConversationEntry>,
    limit_bytes: usize,
}

impl Default for ConversationFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(HISTORY_BYTES)
    }

    /// Feed keeping at most `limit_bytes` of history; oldest entries go first.
    #[must_use]
    pub fn with_limit(limit_bytes: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            sender,
            limit_bytes,
        }
    }

    /// Push an entry to history and live listeners.
    ///
    /// Both happen under the history lock, so a concurrent
    /// [`history_plus_stream`](Self::history_plus_stream) sees each entry once.
    pub fn push(&self, entry: ConversationEntry) {
        let bytes = entry.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.sender.send(entry.clone());
        while inner.total_bytes.saturating_add(bytes) > self.limit_bytes {
            let Some(front) = inner.history.pop_front() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
        }
        inner.history.push_back(StoredEntry { entry, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEntry> {
        self.sender.subscribe()
    }

    /// Snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<ConversationEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.entry.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream that yields history first, then live entries.
    ///
    /// Entries missed by a lagging receiver are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> BoxStream<'static, ConversationEntry> {
        let (rx, history) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let history: Vec<_> = inner.history.iter().map(|s| s.entry.clone()).collect();
            (self.sender.subscribe(), history)
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }

    /// Drop the history. Live subscribers stay attached.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.history.clear();
        inner.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> ConversationEntry {
        ConversationEntry::User {
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn history_then_live() {
        let feed = ConversationFeed::new();
        feed.push(user("one"));
        feed.push(user("two"));

        let mut stream = feed.history_plus_stream();
        feed.push(user("three"));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(stream.next().await.unwrap());
        }
        assert_eq!(seen, [user("one"), user("two"), user("three")]);
    }

    #[tokio::test]
    async fn concurrent_pushes_are_yielded_once() {
        let feed = std::sync::Arc::new(ConversationFeed::new());
        let writer = {
            let feed = std::sync::Arc::clone(&feed);
            std::thread::spawn(move || {
                for i in 0..500 {
                    feed.push(user(&i.to_string()));
                }
            })
        };

        let stream = feed.history_plus_stream();
        let seen: Vec<_> = stream.take(500).collect().await;
        writer.join().unwrap();

        let expected: Vec<_> = (0..500).map(|i| user(&i.to_string())).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn evicts_oldest_past_limit() {
        let size = user("aaaa").approx_bytes();
        let feed = ConversationFeed::with_limit(size * 2);
        feed.push(user("aaaa"));
        feed.push(user("bbbb"));
        feed.push(user("cccc"));
        assert_eq!(feed.history(), [user("bbbb"), user("cccc")]);
    }

    #[tokio::test]
    async fn clear_keeps_subscribers() {
        let feed = ConversationFeed::new();
        let mut rx = feed.subscribe();
        feed.push(user("before"));
        feed.clear();
        assert!(feed.is_empty());
        feed.push(user("after"));
        assert_eq!(rx.recv().await.unwrap(), user("before"));
        assert_eq!(rx.recv().await.unwrap(), user("after"));
        assert_eq!(feed.history(), [user("after")]);
    }
}
