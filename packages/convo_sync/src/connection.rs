//! Push channel for a single conversation.
//!
//! [`ConnectionManager`] owns at most one channel at a time. Opening a new
//! conversation tears the previous channel down before anything else
//! happens, so no frame from the old conversation is delivered after the
//! switch. Frames are decoded into [`Message`]s here; anything that does
//! not decode is logged and dropped without affecting the connection.
//!
//! The current state is published on a `watch` channel so observers can
//! read the status, the last delivered message and the last error
//! without going through the owner.

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{FrameError, TransportError};
use crate::types::{ConversationId, Credential, Message};

/// Raw text frames from an open channel. The stream ends when the server
/// closes the channel.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Something that can open a push channel for a conversation.
pub trait PushTransport: Send + Sync {
    fn open(
        &self,
        conversation: &ConversationId,
        credential: &Credential,
    ) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionSnapshot {
    pub conversation: Option<ConversationId>,
    pub status: ConnectionState,
    pub last_message: Option<Message>,
    pub last_error: Option<TransportError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Message(Message),
    /// The channel ended. `None` means the server closed it cleanly.
    Disconnected(Option<TransportError>),
}

pub fn parse_frame(text: &str) -> Result<Message, FrameError> {
    Ok(serde_json::from_str(text)?)
}

enum Link {
    Idle,
    Opening(BoxFuture<'static, Result<FrameStream, TransportError>>),
    Open(FrameStream),
}

pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    credential: Credential,
    link: Link,
    snapshot: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PushTransport>, credential: Credential) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            transport,
            credential,
            link: Link::Idle,
            snapshot,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> ConnectionState {
        self.snapshot.borrow().status
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.snapshot.borrow().conversation.clone()
    }

    /// Start connecting to `conversation`, releasing any existing channel
    /// first. Progress is reported through [`Self::next_event`].
    pub fn open(&mut self, conversation: ConversationId) {
        self.release();
        info!(conversation = %conversation, "opening push channel");

        let pending = self.transport.open(&conversation, &self.credential);
        self.link = Link::Opening(pending);
        self.snapshot.send_replace(ConnectionSnapshot {
            conversation: Some(conversation),
            status: ConnectionState::Connecting,
            last_message: None,
            last_error: None,
        });
    }

    /// Drop the channel, if any. Does not emit an event.
    pub fn close(&mut self) {
        self.release();
        self.snapshot.send_modify(|s| {
            s.conversation = None;
            s.status = ConnectionState::Disconnected;
        });
    }

    fn release(&mut self) {
        if !matches!(self.link, Link::Idle) {
            debug!("releasing push channel");
        }
        self.link = Link::Idle;
    }

    fn disconnected(&mut self, error: Option<TransportError>) -> ConnectionEvent {
        self.link = Link::Idle;
        match &error {
            Some(err) => warn!(error = %err, "push channel lost"),
            None => info!("push channel closed by server"),
        }
        self.snapshot.send_modify(|s| {
            s.status = ConnectionState::Disconnected;
            s.last_error = error.clone();
        });
        ConnectionEvent::Disconnected(error)
    }

    /// Wait for the next thing that happens on the channel. Pending forever
    /// while no channel is open.
    ///
    /// Cancel safe: dropping the returned future before it completes loses
    /// no frame and leaves the connection as it was.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            match &mut self.link {
                Link::Idle => return std::future::pending().await,
                Link::Opening(pending) => match pending.await {
                    Ok(stream) => {
                        self.link = Link::Open(stream);
                        if let Some(conversation) = self.conversation() {
                            info!(conversation = %conversation, "push channel connected");
                        }
                        self.snapshot.send_modify(|s| {
                            s.status = ConnectionState::Connected;
                            s.last_error = None;
                        });
                        return ConnectionEvent::Connected;
                    }
                    Err(err) => return self.disconnected(Some(err)),
                },
                Link::Open(stream) => match stream.next().await {
                    Some(Ok(text)) => match parse_frame(&text) {
                        Ok(msg) => {
                            self.snapshot.send_modify(|s| s.last_message = Some(msg.clone()));
                            return ConnectionEvent::Message(msg);
                        }
                        Err(err) => {
                            warn!(error = %err, "dropping undecodable frame");
                            continue;
                        }
                    },
                    Some(Err(err)) => return self.disconnected(Some(err)),
                    None => return self.disconnected(None),
                },
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use futures::FutureExt;
    use futures::channel::mpsc;
    use std::sync::Mutex;

    type FrameSender = mpsc::UnboundedSender<Result<String, TransportError>>;

    /// In-memory transport. Each `open` hands out a fresh channel whose
    /// sending side the test picks up with [`MemoryTransport::accept`].
    #[derive(Default)]
    pub struct MemoryTransport {
        opened: Mutex<Vec<ConversationId>>,
        live: Mutex<Option<FrameSender>>,
        refuse: Mutex<Option<TransportError>>,
    }

    impl MemoryTransport {
        pub fn refuse_next(&self, err: TransportError) {
            *self.refuse.lock().unwrap() = Some(err);
        }

        pub fn opened(&self) -> Vec<ConversationId> {
            self.opened.lock().unwrap().clone()
        }

        /// Sender for the most recently opened channel.
        pub fn accept(&self) -> FrameSender {
            self.live.lock().unwrap().clone().unwrap()
        }

        /// Drop the transport's sender so the stream ends once the test's
        /// own clones are gone too.
        pub fn hang_up(&self) {
            self.live.lock().unwrap().take();
        }
    }

    impl PushTransport for MemoryTransport {
        fn open(
            &self,
            conversation: &ConversationId,
            _credential: &Credential,
        ) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
            if let Some(err) = self.refuse.lock().unwrap().take() {
                return futures::future::ready(Err(err)).boxed();
            }
            let (tx, rx) = mpsc::unbounded();
            self.opened.lock().unwrap().push(conversation.clone());
            *self.live.lock().unwrap() = Some(tx);
            futures::future::ready(Ok(rx.boxed())).boxed()
        }
    }

    pub fn frame(msg: &Message) -> Result<String, TransportError> {
        Ok(serde_json::to_string(msg).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::store::test_support::msg;
    use std::time::Duration;

    fn manager() -> (Arc<MemoryTransport>, ConnectionManager) {
        let transport = Arc::new(MemoryTransport::default());
        let mgr = ConnectionManager::new(transport.clone(), Credential::bearer("t"));
        (transport, mgr)
    }

    #[tokio::test]
    async fn idle_manager_never_yields() {
        let (_, mut mgr) = manager();
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
        let res = tokio::time::timeout(Duration::from_millis(20), mgr.next_event()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn delivers_decoded_messages() {
        let (transport, mut mgr) = manager();
        let mut watcher = mgr.subscribe();

        mgr.open("g-1".into());
        assert_eq!(mgr.status(), ConnectionState::Connecting);
        assert_eq!(mgr.next_event().await, ConnectionEvent::Connected);
        assert!(watcher.borrow_and_update().status.is_connected());

        let tx = transport.accept();
        let m = msg("m1", "Coder", "hello", 1);
        tx.unbounded_send(Ok("{not json".to_string())).unwrap();
        tx.unbounded_send(frame(&m)).unwrap();

        // The malformed frame is skipped, not fatal.
        assert_eq!(mgr.next_event().await, ConnectionEvent::Message(m.clone()));
        assert_eq!(mgr.snapshot().last_message, Some(m));
        assert!(mgr.status().is_connected());
    }

    #[tokio::test]
    async fn server_close_and_errors_disconnect() {
        let (transport, mut mgr) = manager();
        mgr.open("g-1".into());
        mgr.next_event().await;

        transport
            .accept()
            .unbounded_send(Err(TransportError::Closed("reset".into())))
            .unwrap();
        assert_eq!(
            mgr.next_event().await,
            ConnectionEvent::Disconnected(Some(TransportError::Closed("reset".into())))
        );
        assert_eq!(mgr.snapshot().last_error, Some(TransportError::Closed("reset".into())));

        mgr.open("g-1".into());
        assert_eq!(mgr.next_event().await, ConnectionEvent::Connected);
        assert_eq!(mgr.snapshot().last_error, None);

        transport.hang_up();
        assert_eq!(mgr.next_event().await, ConnectionEvent::Disconnected(None));
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_open_reports_error() {
        let (transport, mut mgr) = manager();
        transport.refuse_next(TransportError::Unavailable);
        mgr.open("g-1".into());
        assert_eq!(
            mgr.next_event().await,
            ConnectionEvent::Disconnected(Some(TransportError::Unavailable))
        );
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reopening_releases_previous_channel() {
        let (transport, mut mgr) = manager();
        mgr.open("g-1".into());
        mgr.next_event().await;
        let old = transport.accept();

        mgr.open("g-2".into());
        assert_eq!(
            transport.opened(),
            vec![ConversationId::from("g-1"), ConversationId::from("g-2")]
        );
        // The old receiver was dropped along with the link.
        assert!(old.is_closed());

        assert_eq!(mgr.next_event().await, ConnectionEvent::Connected);
        assert_eq!(mgr.conversation(), Some(ConversationId::from("g-2")));
    }

    #[tokio::test]
    async fn close_is_silent() {
        let (_, mut mgr) = manager();
        mgr.open("g-1".into());
        mgr.next_event().await;
        mgr.close();
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
        assert_eq!(mgr.conversation(), None);
        let res = tokio::time::timeout(Duration::from_millis(20), mgr.next_event()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn cancelled_wait_loses_nothing() {
        let (transport, mut mgr) = manager();
        mgr.open("g-1".into());
        mgr.next_event().await;

        let res = tokio::time::timeout(Duration::from_millis(10), mgr.next_event()).await;
        assert!(res.is_err());

        let m = msg("m1", "Coder", "late", 1);
        transport.accept().unbounded_send(frame(&m)).unwrap();
        assert_eq!(mgr.next_event().await, ConnectionEvent::Message(m));
    }
}
