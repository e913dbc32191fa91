//! Relevance oracle boundary.
//!
//! When an older page is loaded, an external service is asked which of
//! the new messages relates most to what is being discussed right now.
//! Its answer is advisory: failures are absorbed by the caller and every
//! returned id is checked against the candidates that were sent.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use crate::error::OracleError;
use crate::types::Message;

/// Messages of recent context sent along with the candidates.
pub const CONTEXT_WINDOW: usize = 10;

pub trait RelevanceOracle: Send + Sync {
    /// Rank candidate messages against the context, most relevant first.
    fn rank(
        &self,
        request: RelevanceRequest,
    ) -> BoxFuture<'static, Result<Vec<String>, OracleError>>;
}

/// Wire form of an oracle call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelevanceRequest {
    /// `"<id>::<sender>: <content>"` per candidate.
    pub messages: Vec<String>,
    /// `"<sender>: <content>"` lines of recent context.
    pub current_conversation: String,
}

/// An oracle call together with the candidate set it was built from.
#[derive(Debug, Clone)]
pub struct RelevanceQuery {
    request: RelevanceRequest,
    candidates: HashSet<String>,
}

impl RelevanceQuery {
    /// Build a query for `page` against `recent` context. Returns `None`
    /// when either side is empty: with no prior conversation there is
    /// nothing to score against.
    pub fn build(page: &[Message], recent: &[Message]) -> Option<Self> {
        if page.is_empty() || recent.is_empty() {
            return None;
        }

        let messages = page
            .iter()
            .map(|m| format!("{}::{}: {}", m.id, m.sender_alias, m.content))
            .collect();
        let current_conversation = recent
            .iter()
            .map(Message::context_line)
            .collect::<Vec<_>>()
            .join("\n");

        Some(Self {
            request: RelevanceRequest {
                messages,
                current_conversation,
            },
            candidates: page.iter().map(|m| m.id.clone()).collect(),
        })
    }

    pub fn request(&self) -> &RelevanceRequest {
        &self.request
    }

    pub fn is_candidate(&self, id: &str) -> bool {
        self.candidates.contains(id)
    }

    /// First ranked id that was actually offered; anything else is dropped.
    pub fn select(&self, ranked: &[String]) -> Option<String> {
        ranked.iter().map(|id| id.trim()).find_map(|id| {
            if self.is_candidate(id) {
                Some(id.to_string())
            } else {
                debug!(id, "oracle returned an id outside the candidate set");
                None
            }
        })
    }
}

/// Oracle that never has an answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledOracle;

impl RelevanceOracle for DisabledOracle {
    fn rank(
        &self,
        _request: RelevanceRequest,
    ) -> BoxFuture<'static, Result<Vec<String>, OracleError>> {
        futures::future::ready(Ok(Vec::new())).boxed()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RelevanceResponse {
    Wrapped {
        #[serde(rename = "relevantMessageIds", default)]
        relevant_message_ids: Vec<String>,
    },
    Bare(Vec<String>),
}

impl RelevanceResponse {
    fn into_ids(self) -> Vec<String> {
        match self {
            RelevanceResponse::Wrapped {
                relevant_message_ids,
            } => relevant_message_ids,
            RelevanceResponse::Bare(ids) => ids,
        }
    }
}

/// Oracle reached over HTTP: POSTs a [`RelevanceRequest`] and accepts
/// either `{"relevantMessageIds": [...]}` or a bare JSON array.
#[derive(Debug, Clone)]
pub struct HttpRelevanceOracle {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRelevanceOracle {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            endpoint: endpoint.into(),
        })
    }
}

impl RelevanceOracle for HttpRelevanceOracle {
    fn rank(
        &self,
        request: RelevanceRequest,
    ) -> BoxFuture<'static, Result<Vec<String>, OracleError>> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        async move {
            let resp = client
                .post(&endpoint)
                .json(&request)
                .send()
                .await
                .map_err(OracleError::from_reqwest)?;

            if !resp.status().is_success() {
                return Err(OracleError::Unavailable(format!("HTTP {}", resp.status())));
            }

            let body = resp.text().await.map_err(OracleError::from_reqwest)?;
            serde_json::from_str::<RelevanceResponse>(&body)
                .map(RelevanceResponse::into_ids)
                .map_err(|e| OracleError::Malformed(e.to_string()))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::msg;
    use axum::{Json, Router, routing::post};

    fn page() -> Vec<Message> {
        vec![
            msg("p1", "User", "what's the weather", 1),
            msg("p2", "Researcher", "sunny", 2),
        ]
    }

    fn recent() -> Vec<Message> {
        vec![
            msg("r1", "User", "remind me of the forecast", 10),
            msg("r2", "Orchestrator", "@Researcher", 11),
        ]
    }

    #[test]
    fn no_query_without_context_or_candidates() {
        assert!(RelevanceQuery::build(&page(), &[]).is_none());
        assert!(RelevanceQuery::build(&[], &recent()).is_none());
    }

    #[test]
    fn query_wire_format() {
        let query = RelevanceQuery::build(&page(), &recent()).unwrap();
        let req = query.request();
        assert_eq!(req.messages, ["p1::User: what's the weather", "p2::Researcher: sunny"]);
        assert_eq!(
            req.current_conversation,
            "User: remind me of the forecast\nOrchestrator: @Researcher"
        );

        let json = serde_json::to_value(req).unwrap();
        assert!(json.get("currentConversation").is_some());
    }

    #[test]
    fn selection_ignores_foreign_ids() {
        let query = RelevanceQuery::build(&page(), &recent()).unwrap();
        assert_eq!(query.select(&[]), None);
        assert_eq!(query.select(&["r1".to_string()]), None);
        assert_eq!(
            query.select(&["r1".to_string(), " p2 ".to_string(), "p1".to_string()]),
            Some("p2".to_string())
        );
    }

    #[tokio::test]
    async fn disabled_oracle_has_no_answer() {
        let query = RelevanceQuery::build(&page(), &recent()).unwrap();
        let ids = DisabledOracle.rank(query.request().clone()).await.unwrap();
        assert!(ids.is_empty());
    }

    async fn spawn_oracle(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://127.0.0.1:{port}/rank")
    }

    #[tokio::test]
    async fn http_oracle_reads_wrapped_and_bare_answers() {
        let app = Router::new().route(
            "/rank",
            post(|Json(req): Json<RelevanceRequest>| async move {
                let first = req.messages[0].split("::").next().unwrap().to_string();
                Json(serde_json::json!({ "relevantMessageIds": [first] }))
            }),
        );
        let oracle = HttpRelevanceOracle::new(spawn_oracle(app).await, None).unwrap();
        let query = RelevanceQuery::build(&page(), &recent()).unwrap();
        assert_eq!(oracle.rank(query.request().clone()).await.unwrap(), ["p1"]);

        let bare = Router::new().route("/rank", post(|| async { Json(vec!["p2"]) }));
        let oracle = HttpRelevanceOracle::new(spawn_oracle(bare).await, None).unwrap();
        assert_eq!(oracle.rank(query.request().clone()).await.unwrap(), ["p2"]);
    }

    #[tokio::test]
    async fn http_oracle_errors() {
        let query = RelevanceQuery::build(&page(), &recent()).unwrap();

        let garbage = Router::new().route("/rank", post(|| async { "definitely not json" }));
        let oracle = HttpRelevanceOracle::new(spawn_oracle(garbage).await, None).unwrap();
        assert!(matches!(
            oracle.rank(query.request().clone()).await,
            Err(OracleError::Malformed(_))
        ));

        let slow = Router::new().route(
            "/rank",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(Vec::<String>::new())
            }),
        );
        let oracle =
            HttpRelevanceOracle::new(spawn_oracle(slow).await, Some(Duration::from_millis(50)))
                .unwrap();
        assert_eq!(
            oracle.rank(query.request().clone()).await,
            Err(OracleError::Timeout)
        );

        let down = HttpRelevanceOracle::new("http://127.0.0.1:1/rank", None).unwrap();
        assert!(matches!(
            down.rank(query.request().clone()).await,
            Err(OracleError::Unavailable(_))
        ));
    }
}
