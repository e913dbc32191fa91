//! The conversation engine.
//!
//! A single task owns the [`ConversationView`] and the push channel of the
//! open conversation, so every store mutation happens in one place and in
//! arrival order. Callers hold an [`EngineHandle`]: commands go in over an
//! mpsc channel with a oneshot reply, state comes back out as an
//! [`EngineSnapshot`] on a `watch` channel and as [`EngineEvent`]s on a
//! broadcast channel.
//!
//! Async work started by the engine (page pulls, oracle calls, the one
//! in-flight submission) is kept as a pending future and polled from the
//! same `select!` loop. Opening another conversation drops the pending
//! page and oracle futures outright; the view's generation check catches
//! anything that still slips through.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::anchor::AnchorDirective;
use crate::api::ConversationApi;
use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionSnapshot, ConnectionState, PushTransport,
};
use crate::error::{EngineError, FetchError, OracleError, SubmitError, TransportError};
use crate::oracle::RelevanceOracle;
use crate::paginator::{FetchRefused, LoadKind};
use crate::turn::TurnState;
use crate::types::{ConversationId, Credential, Message, MessageCreate, MessageRead};
use crate::view::{
    ConversationView, OracleTicket, PageFollowUp, PageOutcome, PageTicket, ViewConfig,
};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;

/// Collaborators the engine talks to.
pub struct EngineDeps {
    pub api: Arc<dyn ConversationApi>,
    pub transport: Arc<dyn PushTransport>,
    pub oracle: Arc<dyn RelevanceOracle>,
    pub credential: Credential,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connection(ConnectionState),
    Appended(Message),
    PageLoaded {
        kind: LoadKind,
        inserted: usize,
        has_more: bool,
    },
    Anchor(AnchorDirective),
    HighlightCleared(String),
    Turn(TurnState),
    Notice(Notice),
}

/// Something worth telling the user about. None of these are fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// The push channel ended; reopen the conversation to reconnect.
    ConnectionLost(Option<TransportError>),
    HistoryFailed(FetchError),
}

#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub conversation: Option<ConversationId>,
    pub connection: ConnectionState,
    pub turn: TurnState,
    pub messages: Arc<Vec<Message>>,
    pub has_more_history: bool,
    pub loading_history: bool,
    pub submitting: bool,
    pub highlighted: Option<String>,
}

impl EngineSnapshot {
    /// Whether the input should take a new message right now.
    pub fn can_submit(&self) -> bool {
        self.conversation.is_some()
            && self.connection.is_connected()
            && !self.turn.is_active()
            && !self.submitting
    }
}

enum EngineCommand {
    Open {
        conversation: ConversationId,
        respond_to: oneshot::Sender<()>,
    },
    LoadOlder {
        respond_to: oneshot::Sender<Result<(), FetchRefused>>,
    },
    Submit {
        content: String,
        respond_to: oneshot::Sender<Result<MessageRead, SubmitError>>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    snapshot: watch::Receiver<EngineSnapshot>,
    connection: watch::Receiver<ConnectionSnapshot>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| EngineError::Gone)?;
        rx.await.map_err(|_| EngineError::NoResponse)
    }

    /// Switch to `conversation`: reset all state, connect, and start
    /// loading its newest page.
    pub async fn open(&self, conversation: impl Into<ConversationId>) -> Result<(), EngineError> {
        let conversation = conversation.into();
        self.request(|respond_to| EngineCommand::Open {
            conversation,
            respond_to,
        })
        .await
    }

    /// Start loading the next older page. Returns once the request is
    /// issued; the page itself shows up in the snapshot.
    pub async fn load_older(&self) -> Result<(), EngineError> {
        self.request(|respond_to| EngineCommand::LoadOlder { respond_to })
            .await??;
        Ok(())
    }

    pub async fn submit(&self, content: impl Into<String>) -> Result<MessageRead, SubmitError> {
        let content = content.into();
        self.request(|respond_to| EngineCommand::Submit {
            content,
            respond_to,
        })
        .await?
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        self.request(|respond_to| EngineCommand::Close { respond_to })
            .await
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|respond_to| EngineCommand::Shutdown { respond_to })
            .await
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.clone()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.connection.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

type PendingPage = BoxFuture<'static, (PageTicket, Result<Vec<Message>, FetchError>)>;
type PendingOracle = BoxFuture<'static, (OracleTicket, Result<Vec<String>, OracleError>)>;
type SubmitReply = oneshot::Sender<Result<MessageRead, SubmitError>>;
type PendingSubmit = BoxFuture<'static, (SubmitReply, Result<MessageRead, FetchError>)>;

pub struct ConversationEngine {
    view: ConversationView,
    connection: ConnectionManager,
    api: Arc<dyn ConversationApi>,
    oracle: Arc<dyn RelevanceOracle>,
    commands: mpsc::Receiver<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    snapshot: watch::Sender<EngineSnapshot>,
    outbox: Vec<EngineEvent>,
    published: Arc<Vec<Message>>,
    published_key: (u64, usize),
    pending_page: Option<PendingPage>,
    pending_oracle: Option<PendingOracle>,
    pending_submit: Option<PendingSubmit>,
}

impl ConversationEngine {
    pub fn spawn(deps: EngineDeps, config: ViewConfig) -> EngineHandle {
        let (sender, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(EngineSnapshot::default());
        let connection = ConnectionManager::new(deps.transport, deps.credential);
        let connection_rx = connection.subscribe();

        let engine = ConversationEngine {
            view: ConversationView::new(config),
            connection,
            api: deps.api,
            oracle: deps.oracle,
            commands,
            events: events.clone(),
            snapshot,
            outbox: Vec::new(),
            published: Arc::new(Vec::new()),
            published_key: (0, 0),
            pending_page: None,
            pending_oracle: None,
            pending_submit: None,
        };
        tokio::spawn(engine.run());

        EngineHandle {
            sender,
            snapshot: snapshot_rx,
            connection: connection_rx,
            events,
        }
    }

    async fn run(mut self) {
        debug!("conversation engine started");
        loop {
            let highlight_deadline = self.view.highlight_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown { respond_to }) => {
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.connection.next_event() => self.handle_connection(event),
                (ticket, result) = poll_pending(&mut self.pending_page) => {
                    self.pending_page = None;
                    self.finish_page(ticket, result);
                }
                (ticket, result) = poll_pending(&mut self.pending_oracle) => {
                    self.pending_oracle = None;
                    self.finish_oracle(ticket, result);
                }
                (respond_to, result) = poll_pending(&mut self.pending_submit) => {
                    self.pending_submit = None;
                    self.finish_submit(respond_to, result);
                }
                _ = sleep_until(highlight_deadline) => {
                    if let Some(id) = self.view.expire_highlight(Instant::now()) {
                        self.emit(EngineEvent::HighlightCleared(id));
                        self.publish();
                    }
                }
            }
        }
        self.connection.close();
        debug!("conversation engine stopped");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Open {
                conversation,
                respond_to,
            } => {
                self.open(conversation);
                let _ = respond_to.send(());
            }
            EngineCommand::LoadOlder { respond_to } => {
                let res = self.start_page();
                if let Err(refused) = &res {
                    debug!(%refused, "older page not requested");
                }
                self.publish();
                let _ = respond_to.send(res);
            }
            EngineCommand::Submit {
                content,
                respond_to,
            } => self.submit(content, respond_to),
            EngineCommand::Close { respond_to } => {
                self.pending_page = None;
                self.pending_oracle = None;
                self.view.close();
                self.connection.close();
                self.publish();
                let _ = respond_to.send(());
            }
            EngineCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn open(&mut self, conversation: ConversationId) {
        info!(conversation = %conversation, "opening conversation");
        self.pending_page = None;
        self.pending_oracle = None;
        self.view.open(conversation.clone());
        self.connection.open(conversation);
        self.emit(EngineEvent::Connection(ConnectionState::Connecting));

        if let Err(refused) = self.start_page() {
            warn!(%refused, "initial history page not requested");
        }
        self.publish();
    }

    fn start_page(&mut self) -> Result<(), FetchRefused> {
        let ticket = self.view.begin_page()?;
        let fetch = self.api.fetch_page(&ticket.conversation, &ticket.cursor);
        self.pending_page = Some(
            async move {
                let result = fetch.await;
                (ticket, result)
            }
            .boxed(),
        );
        Ok(())
    }

    fn finish_page(&mut self, ticket: PageTicket, result: Result<Vec<Message>, FetchError>) {
        let kind = ticket.cursor.kind;
        match self.view.complete_page(ticket, result, Instant::now()) {
            PageOutcome::Stale => return,
            PageOutcome::Failed(err) => {
                warn!(error = %err, ?kind, "history fetch failed");
                self.emit(EngineEvent::Notice(Notice::HistoryFailed(err)));
            }
            PageOutcome::Loaded {
                inserted,
                has_more,
                next,
            } => {
                self.emit(EngineEvent::PageLoaded {
                    kind,
                    inserted,
                    has_more,
                });
                match next {
                    PageFollowUp::Anchor(directive) => self.emit(EngineEvent::Anchor(directive)),
                    PageFollowUp::Consult(ticket) => {
                        let rank = self.oracle.rank(ticket.query.request().clone());
                        self.pending_oracle = Some(
                            async move {
                                let result = rank.await;
                                (ticket, result)
                            }
                            .boxed(),
                        );
                    }
                }
            }
        }
        self.publish();
    }

    fn finish_oracle(&mut self, ticket: OracleTicket, result: Result<Vec<String>, OracleError>) {
        if let Some(directive) = self.view.complete_oracle(ticket, result, Instant::now()) {
            self.emit(EngineEvent::Anchor(directive));
            self.publish();
        }
    }

    fn check_submit(
        &self,
        content: String,
    ) -> Result<(ConversationId, MessageCreate), SubmitError> {
        let message = MessageCreate::new(content)?;
        let conversation = self
            .view
            .conversation()
            .cloned()
            .ok_or(SubmitError::NoConversation)?;
        if self.view.turn_state().is_active() {
            return Err(SubmitError::TurnActive);
        }
        if !self.connection.status().is_connected() {
            return Err(SubmitError::Disconnected);
        }
        if self.pending_submit.is_some() {
            return Err(SubmitError::InFlight);
        }
        Ok((conversation, message))
    }

    fn submit(&mut self, content: String, respond_to: SubmitReply) {
        let (conversation, message) = match self.check_submit(content) {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!(error = %err, "submission refused");
                let _ = respond_to.send(Err(err));
                return;
            }
        };

        let post = self.api.submit(&conversation, message);
        self.pending_submit = Some(
            async move {
                let result = post.await;
                (respond_to, result)
            }
            .boxed(),
        );
        self.publish();
    }

    fn finish_submit(&mut self, respond_to: SubmitReply, result: Result<MessageRead, FetchError>) {
        match &result {
            Ok(ack) => info!(message = %ack.id, turn = %ack.turn_id, "message accepted"),
            Err(err) => warn!(error = %err, "submission failed"),
        }
        let _ = respond_to.send(result.map_err(SubmitError::from));
        self.publish();
    }

    fn handle_connection(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.emit(EngineEvent::Connection(ConnectionState::Connected));
            }
            ConnectionEvent::Message(msg) => {
                let outcome = self.view.apply_live(msg.clone());
                if outcome.inserted {
                    self.emit(EngineEvent::Appended(msg));
                }
                if outcome.transition.is_some() {
                    self.emit(EngineEvent::Turn(self.view.turn_state()));
                }
                if let Some(directive) = outcome.directive {
                    self.emit(EngineEvent::Anchor(directive));
                }
            }
            ConnectionEvent::Disconnected(error) => {
                self.emit(EngineEvent::Connection(ConnectionState::Disconnected));
                self.emit(EngineEvent::Notice(Notice::ConnectionLost(error)));
            }
        }
        self.publish();
    }

    /// Queue an event; it goes out with the next [`publish`](Self::publish).
    fn emit(&mut self, event: EngineEvent) {
        self.outbox.push(event);
    }

    fn publish(&mut self) {
        let key = (self.view.generation(), self.view.store().len());
        if key != self.published_key {
            self.published = Arc::new(self.view.messages().to_vec());
            self.published_key = key;
        }

        self.snapshot.send_replace(EngineSnapshot {
            conversation: self.view.conversation().cloned(),
            connection: self.connection.status(),
            turn: self.view.turn_state(),
            messages: self.published.clone(),
            has_more_history: self.view.has_more_history(),
            loading_history: self.view.is_loading_history(),
            submitting: self.pending_submit.is_some(),
            highlighted: self.view.highlighted().map(str::to_string),
        });

        // Subscribers see an event only once the snapshot reflects it.
        for event in self.outbox.drain(..) {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

/// Await a pending future in place; never resolves when there is none.
async fn poll_pending<T>(pending: &mut Option<BoxFuture<'static, T>>) -> T {
    match pending {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
