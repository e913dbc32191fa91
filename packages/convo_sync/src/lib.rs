//! # Conversation Sync
//!
//! Keeps a live multi-agent conversation in sync on the client side.
//!
//! ## Overview
//!
//! A conversation is an ordered list of messages exchanged between a human
//! and a group of agents. Messages reach the client two ways: pushed live
//! over a WebSocket as they are produced, and pulled in pages of older
//! history over HTTP. This library merges both into one ordered,
//! duplicate-free list and keeps the state around it:
//! - Which direction to page next and whether there is anything left
//! - Whether a turn is in progress, which gates new submissions
//! - Where the viewport should go after each change, including centering on
//!   a message an external relevance service picked out of an older page
//!
//! ## Layering
//!
//! ```text
//! EngineHandle ──commands──▶ ConversationEngine (one task)
//!                              ├── ConversationView
//!                              │     ├── MessageStore
//!                              │     ├── HistoryPaginator
//!                              │     ├── TurnStateMachine
//!                              │     └── ScrollAnchor
//!                              ├── ConnectionManager ── PushTransport (WsTransport)
//!                              ├── ConversationApi (HttpConversationApi)
//!                              └── RelevanceOracle (HttpRelevanceOracle)
//! ```
//!
//! [`ConversationView`] is plain synchronous state and can be driven
//! directly. [`ConversationEngine`] wraps it with the network pieces.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use convo_sync::{Credential, Endpoints, SyncClient, ViewConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SyncClient::new(
//!     Endpoints::new("http://localhost:8000", "ws://localhost:8000"),
//!     Credential::bearer("token"),
//! );
//! let engine = client.spawn_engine(ViewConfig::default())?;
//! engine.open("group-id").await?;
//!
//! let mut updates = engine.watch();
//! while updates.changed().await.is_ok() {
//!     let snapshot = updates.borrow().clone();
//!     println!("{} messages, turn {:?}", snapshot.messages.len(), snapshot.turn);
//! }
//! # Ok(())
//! # }
//! ```

pub mod anchor;
pub mod api;
pub mod connection;
pub mod engine;
pub mod error;
pub mod oracle;
pub mod paginator;
pub mod store;
pub mod turn;
pub mod types;
pub mod view;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

pub use anchor::{AnchorDirective, HIGHLIGHT_DURATION, ScrollAnchor};
pub use api::{ConversationApi, HttpConversationApi};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionSnapshot, ConnectionState, PushTransport,
};
pub use engine::{ConversationEngine, EngineDeps, EngineEvent, EngineHandle, EngineSnapshot, Notice};
pub use error::{EngineError, FetchError, OracleError, SubmitError, TransportError};
pub use oracle::{DisabledOracle, HttpRelevanceOracle, RelevanceOracle, RelevanceQuery};
pub use paginator::{FetchRefused, HistoryPaginator, LoadKind, PAGE_SIZE, PageCursor};
pub use store::MessageStore;
pub use turn::{TurnRules, TurnState, TurnStateMachine, TurnTransition};
pub use types::{
    ConversationId, Credential, Message, MessageCreate, MessageRead, Sender, ToolCall,
};
pub use view::{ConversationView, ViewConfig};
pub use ws::WsTransport;

/// Where the backend and the relevance oracle live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// HTTP root, e.g. `http://localhost:8000`.
    pub api_url: String,
    /// WebSocket root, e.g. `ws://localhost:8000`.
    pub ws_url: String,
    /// Relevance oracle endpoint. `None` disables relevance anchoring.
    pub oracle_url: Option<String>,
    pub oracle_timeout: Option<Duration>,
}

impl Endpoints {
    pub fn new(api_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ws_url: ws_url.into(),
            oracle_url: None,
            oracle_timeout: None,
        }
    }

    pub fn with_oracle(mut self, url: impl Into<String>, timeout: Option<Duration>) -> Self {
        self.oracle_url = Some(url.into());
        self.oracle_timeout = timeout;
        self
    }
}

/// High-level entry point: wires the HTTP, WebSocket and oracle clients
/// for one backend and one credential.
#[derive(Debug, Clone)]
pub struct SyncClient {
    endpoints: Endpoints,
    credential: Credential,
    api: HttpConversationApi,
}

impl SyncClient {
    pub fn new(endpoints: Endpoints, credential: Credential) -> Self {
        let api = HttpConversationApi::new(endpoints.api_url.clone(), credential.clone());
        Self {
            endpoints,
            credential,
            api,
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// The request/response client, for one-off history reads and sends.
    pub fn api(&self) -> &HttpConversationApi {
        &self.api
    }

    pub fn oracle(&self) -> Result<Arc<dyn RelevanceOracle>, reqwest::Error> {
        Ok(match &self.endpoints.oracle_url {
            Some(url) => Arc::new(HttpRelevanceOracle::new(
                url.clone(),
                self.endpoints.oracle_timeout,
            )?),
            None => Arc::new(DisabledOracle),
        })
    }

    /// Start an engine task on the current runtime.
    pub fn spawn_engine(&self, config: ViewConfig) -> Result<EngineHandle, reqwest::Error> {
        let deps = EngineDeps {
            api: Arc::new(self.api.clone()),
            transport: Arc::new(WsTransport::new(self.endpoints.ws_url.clone())),
            oracle: self.oracle()?,
            credential: self.credential.clone(),
        };
        Ok(ConversationEngine::spawn(deps, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_builder() {
        let endpoints = Endpoints::new("http://a", "ws://a")
            .with_oracle("http://o/rank", Some(Duration::from_secs(3)));
        assert_eq!(endpoints.oracle_url.as_deref(), Some("http://o/rank"));
        assert_eq!(endpoints.oracle_timeout, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn engine_starts_idle() {
        let client = SyncClient::new(
            Endpoints::new("http://127.0.0.1:1", "ws://127.0.0.1:1"),
            Credential::bearer("t"),
        );
        let engine = client.spawn_engine(ViewConfig::default()).unwrap();
        let snapshot = engine.snapshot();
        assert!(snapshot.conversation.is_none());
        assert!(!snapshot.can_submit());
        engine.shutdown().await.unwrap();
    }
}
