//! Cursor-based history paging.
//!
//! The cursor for an older page is the timestamp of the oldest message
//! currently held, never a count of what has been loaded, so live inserts
//! at the tail cannot shift the window. At most one page request is
//! outstanding per conversation; a short page ends paging for good.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

/// Messages per history page.
pub const PAGE_SIZE: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadKind {
    /// The newest page, fetched when a conversation is opened.
    Initial,
    /// A page older than everything held, fetched on demand.
    Older,
}

/// A page the caller should now fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageCursor {
    pub kind: LoadKind,
    /// Exclusive upper bound; `None` asks for the newest page.
    pub before: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FetchRefused {
    #[error("a history page is already being fetched")]
    InFlight,

    #[error("no older history")]
    Exhausted,

    #[error("no conversation is open")]
    NoConversation,
}

#[derive(Clone, Debug)]
pub struct HistoryPaginator {
    page_size: usize,
    has_more: bool,
    in_flight: bool,
    initial_loaded: bool,
}

impl Default for HistoryPaginator {
    fn default() -> Self {
        Self::new(PAGE_SIZE)
    }
}

impl HistoryPaginator {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            has_more: true,
            in_flight: false,
            initial_loaded: false,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn initial_loaded(&self) -> bool {
        self.initial_loaded
    }

    /// Reserve the single in-flight slot and work out the next cursor.
    /// `oldest` is the timestamp of the current head of the store.
    pub fn begin(&mut self, oldest: Option<DateTime<Utc>>) -> Result<PageCursor, FetchRefused> {
        if self.in_flight {
            return Err(FetchRefused::InFlight);
        }
        if !self.has_more {
            return Err(FetchRefused::Exhausted);
        }

        let cursor = if self.initial_loaded {
            PageCursor {
                kind: LoadKind::Older,
                before: oldest,
                limit: self.page_size,
            }
        } else {
            PageCursor {
                kind: LoadKind::Initial,
                before: None,
                limit: self.page_size,
            }
        };

        self.in_flight = true;
        debug!(kind = ?cursor.kind, before = ?cursor.before, "history page requested");
        Ok(cursor)
    }

    /// Record a returned page of `len` messages. Returns `has_more`.
    pub fn complete(&mut self, kind: LoadKind, len: usize) -> bool {
        self.in_flight = false;
        if kind == LoadKind::Initial {
            self.initial_loaded = true;
        }
        if len < self.page_size {
            debug!(len, page_size = self.page_size, "short page; history exhausted");
            self.has_more = false;
        }
        self.has_more
    }

    /// Roll back after a failed pull so the same page can be retried.
    pub fn fail(&mut self) {
        self.in_flight = false;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.page_size);
    }
}
