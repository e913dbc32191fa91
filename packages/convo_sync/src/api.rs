//! Request/response side of the backend: history pages and submissions.

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::FetchError;
use crate::paginator::PageCursor;
use crate::types::{ConversationId, Credential, Message, MessageCreate, MessageRead, format_cursor};

pub trait ConversationApi: Send + Sync {
    /// Fetch up to `cursor.limit` messages strictly older than
    /// `cursor.before` (or the newest ones), oldest first.
    fn fetch_page(
        &self,
        conversation: &ConversationId,
        cursor: &PageCursor,
    ) -> BoxFuture<'static, Result<Vec<Message>, FetchError>>;

    /// Post a human message. The message itself arrives later on the push
    /// channel; the acknowledgment only carries its ids.
    fn submit(
        &self,
        conversation: &ConversationId,
        message: MessageCreate,
    ) -> BoxFuture<'static, Result<MessageRead, FetchError>>;
}

#[derive(Debug, Clone)]
pub struct HttpConversationApi {
    client: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, credential)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        }
    }

    pub fn messages_url(&self, conversation: &ConversationId) -> String {
        format!("{}/groups/{}/messages", self.base_url, conversation)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(FetchError::Status {
        status: status.as_u16(),
        body,
    })
}

impl ConversationApi for HttpConversationApi {
    fn fetch_page(
        &self,
        conversation: &ConversationId,
        cursor: &PageCursor,
    ) -> BoxFuture<'static, Result<Vec<Message>, FetchError>> {
        let mut query = vec![("limit", cursor.limit.to_string())];
        if let Some(before) = &cursor.before {
            query.push(("before_timestamp", format_cursor(before)));
        }
        let request = self
            .client
            .get(self.messages_url(conversation))
            .bearer_auth(self.credential.secret())
            .query(&query);

        async move {
            let resp = request.send().await.map_err(FetchError::from_reqwest)?;
            let resp = check_status(resp).await?;
            let mut page: Vec<Message> = resp.json().await.map_err(FetchError::from_reqwest)?;

            if !page.is_sorted_by_key(|m| m.timestamp) {
                debug!(len = page.len(), "history page out of order; sorting");
                page.sort_by_key(|m| m.timestamp);
            }
            Ok(page)
        }
        .boxed()
    }

    fn submit(
        &self,
        conversation: &ConversationId,
        message: MessageCreate,
    ) -> BoxFuture<'static, Result<MessageRead, FetchError>> {
        let request = self
            .client
            .post(self.messages_url(conversation))
            .bearer_auth(self.credential.secret())
            .json(&message);

        async move {
            let resp = request.send().await.map_err(FetchError::from_reqwest)?;
            let resp = check_status(resp).await?;
            if resp.status() != StatusCode::ACCEPTED {
                debug!(status = %resp.status(), "submission acknowledged with unexpected status");
            }
            resp.json().await.map_err(FetchError::from_reqwest)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paginator::LoadKind;
    use crate::store::test_support::{at, ts};
    use axum::{
        Json, Router,
        extract::{Path, Query},
        http::{HeaderMap, StatusCode as AxumStatus},
        response::{IntoResponse, Response},
        routing::get,
    };
    use serde::Deserialize;
    use serde_json::Value;

    #[derive(Deserialize)]
    struct PageParams {
        limit: usize,
        before_timestamp: Option<String>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer tok")
    }

    async fn list(
        Path(group): Path<String>,
        Query(params): Query<PageParams>,
        headers: HeaderMap,
    ) -> Response {
        if !authorized(&headers) {
            return (AxumStatus::UNAUTHORIZED, "bad token").into_response();
        }
        if group == "missing" {
            return (AxumStatus::NOT_FOUND, "Group not found").into_response();
        }
        // Messages 0..100 one second apart, served newest first to
        // exercise client-side ordering.
        let before = params
            .before_timestamp
            .and_then(|s| crate::types::parse_timestamp(&s));
        let mut page: Vec<_> = (0..100)
            .rev()
            .map(|i| at(&format!("m{i}"), i))
            .filter(|m| before.is_none_or(|b| m.timestamp < b))
            .take(params.limit)
            .collect();
        if group == "ordered" {
            page.reverse();
        }
        Json(page).into_response()
    }

    async fn post_message(headers: HeaderMap, Json(body): Json<Value>) -> Response {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        let content = body["content"].as_str().unwrap_or_default().to_string();
        let ack = MessageRead {
            id: "new".into(),
            turn_id: "turn-9".into(),
            sender_alias: "User".into(),
            content,
        };
        (AxumStatus::ACCEPTED, Json(ack)).into_response()
    }

    async fn spawn_api() -> String {
        let app = Router::new().route("/groups/{group}/messages", get(list).post(post_message));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://127.0.0.1:{port}")
    }

    fn cursor(before: Option<i64>, limit: usize) -> PageCursor {
        PageCursor {
            kind: if before.is_some() { LoadKind::Older } else { LoadKind::Initial },
            before: before.map(ts),
            limit,
        }
    }

    #[tokio::test]
    async fn fetches_pages_oldest_first() {
        let api = HttpConversationApi::new(spawn_api().await, Credential::bearer("tok"));

        let newest = api.fetch_page(&"g-1".into(), &cursor(None, 50)).await.unwrap();
        assert_eq!(newest.len(), 50);
        assert_eq!(newest.first().unwrap().id, "m50");
        assert_eq!(newest.last().unwrap().id, "m99");

        let older = api
            .fetch_page(&"ordered".into(), &cursor(Some(50), 50))
            .await
            .unwrap();
        assert_eq!(older.first().unwrap().id, "m0");
        assert_eq!(older.last().unwrap().id, "m49");

        let tail = api.fetch_page(&"g-1".into(), &cursor(Some(3), 50)).await.unwrap();
        assert_eq!(tail.len(), 3);
    }

    #[tokio::test]
    async fn surfaces_http_errors() {
        let base = spawn_api().await;
        let api = HttpConversationApi::new(base.clone(), Credential::bearer("tok"));
        let err = api
            .fetch_page(&"missing".into(), &cursor(None, 50))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::Status {
                status: 404,
                body: "Group not found".into()
            }
        );

        let intruder = HttpConversationApi::new(base, Credential::bearer("nope"));
        assert!(matches!(
            intruder.fetch_page(&"g-1".into(), &cursor(None, 50)).await,
            Err(FetchError::Status { status: 401, .. })
        ));

        let down = HttpConversationApi::new("http://127.0.0.1:1", Credential::bearer("tok"));
        assert_eq!(
            down.fetch_page(&"g-1".into(), &cursor(None, 50)).await,
            Err(FetchError::Unavailable)
        );
    }

    #[tokio::test]
    async fn submit_returns_acknowledgment() {
        let api = HttpConversationApi::new(spawn_api().await, Credential::bearer("tok"));
        let ack = api
            .submit(&"g-1".into(), MessageCreate::new("ship it").unwrap())
            .await
            .unwrap();
        assert_eq!(ack.content, "ship it");
        assert_eq!(ack.turn_id, "turn-9");
    }

    #[test]
    fn url_building_trims_slash() {
        let api = HttpConversationApi::new("http://host:8000/", Credential::bearer("t"));
        assert_eq!(
            api.messages_url(&"abc".into()),
            "http://host:8000/groups/abc/messages"
        );
    }
}
