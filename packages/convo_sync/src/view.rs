//! The conversation view: store, pager, turn machine and anchor policy for
//! the conversation that is currently open.
//!
//! Everything here is synchronous. Async work (page pulls, oracle calls)
//! is described by tickets handed out by the view and completed later by
//! the caller; each ticket carries the generation of the conversation it
//! was issued for, and results for an older generation are discarded.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::anchor::{AnchorDirective, HIGHLIGHT_DURATION, ScrollAnchor};
use crate::error::{FetchError, OracleError};
use crate::oracle::{CONTEXT_WINDOW, RelevanceQuery};
use crate::paginator::{FetchRefused, HistoryPaginator, LoadKind, PAGE_SIZE, PageCursor};
use crate::store::MessageStore;
use crate::turn::{TurnRules, TurnState, TurnStateMachine, TurnTransition};
use crate::types::{ConversationId, Message};

#[derive(Clone, Debug)]
pub struct ViewConfig {
    pub page_size: usize,
    pub context_window: usize,
    pub highlight_for: Duration,
    pub turn_rules: TurnRules,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            context_window: CONTEXT_WINDOW,
            highlight_for: HIGHLIGHT_DURATION,
            turn_rules: TurnRules::default(),
        }
    }
}

/// An outstanding history pull.
#[derive(Clone, Debug)]
pub struct PageTicket {
    pub generation: u64,
    pub load: u64,
    pub conversation: ConversationId,
    pub cursor: PageCursor,
}

/// An outstanding oracle call for the page of load `load`.
#[derive(Clone, Debug)]
pub struct OracleTicket {
    pub generation: u64,
    pub load: u64,
    pub kind: LoadKind,
    pub query: RelevanceQuery,
}

#[derive(Debug)]
pub enum PageOutcome {
    /// The ticket belongs to a conversation that is no longer open.
    Stale,
    /// The pull failed; paging state was rolled back.
    Failed(FetchError),
    Loaded {
        inserted: usize,
        has_more: bool,
        next: PageFollowUp,
    },
}

#[derive(Debug)]
pub enum PageFollowUp {
    /// No oracle call needed; apply this directly.
    Anchor(AnchorDirective),
    /// Ask the oracle, then finish with [`ConversationView::complete_oracle`].
    Consult(OracleTicket),
}

#[derive(Debug, Default, PartialEq)]
pub struct LiveOutcome {
    pub inserted: bool,
    pub transition: Option<TurnTransition>,
    pub directive: Option<AnchorDirective>,
}

#[derive(Debug)]
pub struct ConversationView {
    config: ViewConfig,
    conversation: Option<ConversationId>,
    generation: u64,
    load_seq: u64,
    store: MessageStore,
    pager: HistoryPaginator,
    turn: TurnStateMachine,
    anchor: ScrollAnchor,
}

impl Default for ConversationView {
    fn default() -> Self {
        Self::new(ViewConfig::default())
    }
}

impl ConversationView {
    pub fn new(config: ViewConfig) -> Self {
        Self {
            pager: HistoryPaginator::new(config.page_size),
            turn: TurnStateMachine::new(config.turn_rules.clone()),
            anchor: ScrollAnchor::new(config.highlight_for),
            config,
            conversation: None,
            generation: 0,
            load_seq: 0,
            store: MessageStore::new(),
        }
    }

    /// Reset everything for `conversation`. Tickets issued before this
    /// call become stale.
    pub fn open(&mut self, conversation: ConversationId) -> u64 {
        self.reset();
        debug!(conversation = %conversation, generation = self.generation, "conversation opened");
        self.conversation = Some(conversation);
        self.generation
    }

    pub fn close(&mut self) {
        self.reset();
        self.conversation = None;
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.load_seq = 0;
        self.store.clear();
        self.pager.reset();
        self.turn.reset();
        self.anchor.reset();
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn turn_state(&self) -> TurnState {
        self.turn.state()
    }

    pub fn has_more_history(&self) -> bool {
        self.pager.has_more()
    }

    pub fn is_loading_history(&self) -> bool {
        self.pager.is_in_flight()
    }

    pub fn highlighted(&self) -> Option<&str> {
        self.anchor.highlighted()
    }

    pub fn highlight_deadline(&self) -> Option<Instant> {
        self.anchor.deadline()
    }

    /// Apply a message from the push channel.
    pub fn apply_live(&mut self, msg: Message) -> LiveOutcome {
        match &self.conversation {
            Some(open) if *open == msg.conversation_id => {}
            _ => {
                warn!(
                    message = %msg.id,
                    conversation = %msg.conversation_id,
                    "live message for a conversation that is not open"
                );
                return LiveOutcome::default();
            }
        }

        // A copy already merged from history still counts for the turn.
        let transition = self.turn.observe(&msg);
        let inserted = self.store.append(msg);

        LiveOutcome {
            inserted,
            transition,
            directive: inserted.then(|| self.anchor.after_live_append()),
        }
    }

    /// Reserve the history slot for the next page.
    pub fn begin_page(&mut self) -> Result<PageTicket, FetchRefused> {
        let conversation = self
            .conversation
            .clone()
            .ok_or(FetchRefused::NoConversation)?;
        let cursor = self.pager.begin(self.store.oldest_timestamp())?;
        self.load_seq += 1;
        Ok(PageTicket {
            generation: self.generation,
            load: self.load_seq,
            conversation,
            cursor,
        })
    }

    /// Merge the result of a history pull.
    pub fn complete_page(
        &mut self,
        ticket: PageTicket,
        result: Result<Vec<Message>, FetchError>,
        now: Instant,
    ) -> PageOutcome {
        if ticket.generation != self.generation {
            debug!(
                ticket = ticket.generation,
                current = self.generation,
                "discarding history page for a closed conversation"
            );
            return PageOutcome::Stale;
        }

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.pager.fail();
                return PageOutcome::Failed(e);
            }
        };

        let kind = ticket.cursor.kind;
        let has_more = self.pager.complete(kind, page.len());

        // Context is what was on screen before the page arrived.
        let query = RelevanceQuery::build(&page, self.store.recent(self.config.context_window));
        let inserted = self.store.prepend_page(page);
        debug!(inserted, has_more, ?kind, "history page merged");

        let next = match query {
            Some(query) => PageFollowUp::Consult(OracleTicket {
                generation: ticket.generation,
                load: ticket.load,
                kind,
                query,
            }),
            None => PageFollowUp::Anchor(self.anchor.after_page_load(kind, None, now)),
        };

        PageOutcome::Loaded {
            inserted,
            has_more,
            next,
        }
    }

    /// Finish a page load with the oracle's answer. Returns `None` when the
    /// answer no longer applies: the conversation changed, or a newer page
    /// has been loaded since.
    pub fn complete_oracle(
        &mut self,
        ticket: OracleTicket,
        result: Result<Vec<String>, OracleError>,
        now: Instant,
    ) -> Option<AnchorDirective> {
        if ticket.generation != self.generation || ticket.load != self.load_seq {
            debug!(load = ticket.load, "discarding superseded relevance answer");
            return None;
        }

        let relevant = match result {
            Ok(ranked) => ticket
                .query
                .select(&ranked)
                .filter(|id| self.store.contains(id)),
            Err(e) => {
                warn!("relevance oracle failed, using default anchor: {}", e);
                None
            }
        };

        Some(self.anchor.after_page_load(ticket.kind, relevant, now))
    }

    /// Clear an expired highlight. Returns the id that was cleared.
    pub fn expire_highlight(&mut self, now: Instant) -> Option<String> {
        self.anchor.expire(now)
    }
}
