//! WebSocket push transport.
//!
//! The backend serves one channel per conversation at
//! `{base}/ws/{conversation}`. The token is sent both as a bearer header
//! and as a `token` query parameter, since browser-style servers only
//! read the latter.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio_tungstenite::tungstenite::{
    self, Message as WsMessage,
    client::IntoClientRequest,
    http::{HeaderValue, header::AUTHORIZATION},
};
use tracing::debug;

use crate::connection::{FrameStream, PushTransport};
use crate::error::TransportError;
use crate::types::{ConversationId, Credential};

#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    /// `base_url` is the `ws://` or `wss://` root of the backend.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn channel_url(&self, conversation: &ConversationId, credential: &Credential) -> String {
        format!(
            "{}/ws/{}?token={}",
            self.base_url.trim_end_matches('/'),
            conversation,
            credential.secret()
        )
    }
}

impl PushTransport for WsTransport {
    fn open(
        &self,
        conversation: &ConversationId,
        credential: &Credential,
    ) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let url = self.channel_url(conversation, credential);
        let bearer = format!("Bearer {}", credential.secret());
        async move {
            let mut request = url
                .into_client_request()
                .map_err(|e| TransportError::Rejected(e.to_string()))?;
            let header = HeaderValue::from_str(&bearer)
                .map_err(|e| TransportError::Rejected(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, header);

            let (ws, _) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(TransportError::from_tungstenite)?;

            let frames = ws.filter_map(|item| {
                let frame = match item {
                    Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(WsMessage::Close(reason)) => {
                        debug!(?reason, "server sent close frame");
                        None
                    }
                    // Control frames are answered by tungstenite itself.
                    Ok(_) => None,
                    Err(tungstenite::Error::ConnectionClosed) => None,
                    Err(err) => Some(Err(TransportError::from_tungstenite(err))),
                };
                futures::future::ready(frame)
            });
            Ok(frames.boxed())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvent, ConnectionManager};
    use crate::store::test_support::msg;
    use axum::{
        Router,
        extract::{Path, Query, WebSocketUpgrade, ws::Message as AxumWs},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
    };
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn handler(
        ws: WebSocketUpgrade,
        Path(group): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        let bearer_ok = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Bearer sekrit");
        if query.get("token").map(String::as_str) != Some("sekrit") || !bearer_ok {
            return StatusCode::FORBIDDEN.into_response();
        }
        ws.on_upgrade(move |mut socket| async move {
            let m = msg("m1", "Coder", &format!("hello from {group}"), 1);
            let _ = socket.send(AxumWs::Binary(vec![1, 2, 3].into())).await;
            let _ = socket
                .send(AxumWs::Text(serde_json::to_string(&m).unwrap().into()))
                .await;
            let _ = socket.send(AxumWs::Close(None)).await;
            // Let the client finish the closing handshake.
            while let Some(Ok(_)) = socket.recv().await {}
        })
    }

    async fn spawn_server() -> String {
        let app = Router::new().route("/ws/{group}", get(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://127.0.0.1:{port}")
    }

    #[test]
    fn channel_url_shape() {
        let t = WsTransport::new("ws://localhost:8000/");
        assert_eq!(
            t.channel_url(&"g-1".into(), &Credential::bearer("abc")),
            "ws://localhost:8000/ws/g-1?token=abc"
        );
    }

    #[tokio::test]
    async fn receives_text_frames_until_close() {
        let base = spawn_server().await;
        let mut mgr = ConnectionManager::new(
            Arc::new(WsTransport::new(base)),
            Credential::bearer("sekrit"),
        );
        mgr.open("g-7".into());

        assert_eq!(mgr.next_event().await, ConnectionEvent::Connected);
        match mgr.next_event().await {
            ConnectionEvent::Message(m) => assert_eq!(m.content, "hello from g-7"),
            other => panic!("expected a message, got {other:?}"),
        }
        assert_eq!(mgr.next_event().await, ConnectionEvent::Disconnected(None));
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let base = spawn_server().await;
        let transport = WsTransport::new(base);
        let err = match transport
            .open(&"g-1".into(), &Credential::bearer("wrong"))
            .await
        {
            Err(err) => err,
            Ok(_) => panic!("handshake should fail"),
        };
        assert_eq!(err, TransportError::Rejected("HTTP 403 Forbidden".into()));
    }

    #[tokio::test]
    async fn nothing_listening_is_unavailable() {
        let transport = WsTransport::new("ws://127.0.0.1:1");
        let res = transport.open(&"g-1".into(), &Credential::bearer("t")).await;
        assert!(matches!(res, Err(TransportError::Unavailable)));
    }
}
