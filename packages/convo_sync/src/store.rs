//! Ordered, deduplicated message sequence for one conversation.
//!
//! Two mutation entry points exist: [`MessageStore::append`] for live
//! arrivals and [`MessageStore::prepend_page`] for older history. A page
//! is always merged in front of whatever the head is *when the page is
//! merged*, so live messages that arrived during the round trip survive.
//!
//! Live messages are placed at the tail in arrival order even when their
//! timestamp is older than the current tail (clock skew, late delivery).
//! Already-rendered content is never reordered; the price is that the
//! sequence is only sorted by timestamp as long as the backend's clock is.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::ops::Range;
use tracing::debug;

use crate::types::Message;

#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a live message at the tail. Returns false if the id is
    /// already present.
    pub fn append(&mut self, msg: Message) -> bool {
        if self.ids.contains(&msg.id) {
            return false;
        }

        if let Some(last) = self.messages.last() {
            if msg.timestamp < last.timestamp {
                debug!(
                    id = %msg.id,
                    tail = %last.id,
                    "live message is older than the tail; keeping arrival order"
                );
            }
        }

        self.ids.insert(msg.id.clone());
        self.messages.push(msg);
        true
    }

    /// Insert a block of older messages (oldest first) in front of the
    /// current head. Ids already present, in the store or earlier in the
    /// page, are skipped. Returns how many messages were inserted.
    pub fn prepend_page(&mut self, page: Vec<Message>) -> usize {
        let mut block = Vec::with_capacity(page.len());
        for msg in page {
            if self.ids.insert(msg.id.clone()) {
                block.push(msg);
            }
        }

        let inserted = block.len();
        if inserted > 0 {
            block.append(&mut self.messages);
            self.messages = block;
        }
        inserted
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Timestamp of the current head; the cursor for the next older page.
    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.oldest().map(|m| m.timestamp)
    }

    /// Number of messages strictly newer than `cursor`.
    pub fn count_since(&self, cursor: DateTime<Utc>) -> usize {
        self.messages
            .iter()
            .filter(|m| m.timestamp > cursor)
            .count()
    }

    /// Ids of the messages at positions `range`, clamped to the store.
    pub fn ids_in_range(&self, range: Range<usize>) -> Vec<&str> {
        let end = range.end.min(self.messages.len());
        let start = range.start.min(end);
        self.messages[start..end]
            .iter()
            .map(|m| m.id.as_str())
            .collect()
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}
