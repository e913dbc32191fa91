use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use crate::error::SubmitError;

/// Alias the backend reserves for the human participant.
pub const HUMAN_ALIAS: &str = "User";

/// Alias of the agent that coordinates a turn.
pub const ORCHESTRATOR_ALIAS: &str = "Orchestrator";

/// Token the orchestrator puts in its final message of a turn.
pub const COMPLETION_MARKER: &str = "TASK_COMPLETE";

/// Upper bound on submitted message length, in characters.
pub const MAX_CONTENT_CHARS: usize = 1000;

/// Opaque identifier of a conversation (a chat group on the backend).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Bearer token presented when a channel or request is established.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A single conversation record as delivered by the push channel and the
/// history endpoint. Read-only from this crate's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    #[serde(rename = "group_id")]
    pub conversation_id: ConversationId,

    pub turn_id: String,

    pub sender_alias: String,

    #[serde(default)]
    pub content: String,

    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Message {
    pub fn is_from_human(&self) -> bool {
        self.sender_alias == HUMAN_ALIAS
    }

    pub fn sender(&self) -> Sender {
        Sender::classify(&self.sender_alias)
    }

    /// `"<sender>: <content>"`, the line format used for relevance context.
    pub fn context_line(&self) -> String {
        format!("{}: {}", self.sender_alias, self.content)
    }

    /// Tool invocations carried in the metadata bag.
    ///
    /// Agents serialize their LangChain message into `meta`, so the calls
    /// live under `meta.kwargs.tool_calls`; a flat `meta.tool_calls` is
    /// accepted as well. Entries without a name are skipped.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        let Some(meta) = &self.meta else {
            return Vec::new();
        };

        let calls = meta
            .pointer("/kwargs/tool_calls")
            .or_else(|| meta.get("tool_calls"))
            .and_then(Value::as_array);

        calls
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let name = call.get("name")?.as_str()?.to_string();
                        let args = call.get("args").cloned().unwrap_or(Value::Null);
                        Some(ToolCall { name, args })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
}

/// Coarse role of a sender, derived from its alias by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Orchestrator,
    Agent,
    /// Tool output; tools report under lowercase aliases.
    Tool,
}

impl Sender {
    pub fn classify(alias: &str) -> Self {
        if alias == HUMAN_ALIAS {
            Sender::User
        } else if alias == ORCHESTRATOR_ALIAS {
            Sender::Orchestrator
        } else if alias.chars().next().is_some_and(|c| c.is_uppercase()) {
            Sender::Agent
        } else {
            Sender::Tool
        }
    }
}

/// Body of a message submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageCreate {
    content: String,
}

impl MessageCreate {
    pub fn new(content: impl Into<String>) -> Result<Self, SubmitError> {
        let content = content.into();
        let chars = content.chars().count();
        if chars == 0 {
            return Err(SubmitError::InvalidContent(
                "message cannot be empty".to_string(),
            ));
        }
        if chars > MAX_CONTENT_CHARS {
            return Err(SubmitError::InvalidContent(format!(
                "message is too long ({chars} > {MAX_CONTENT_CHARS} characters)"
            )));
        }
        Ok(Self { content })
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Acknowledgment returned by the backend for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRead {
    pub id: String,
    pub turn_id: String,
    pub sender_alias: String,
    pub content: String,
}

/// Render a timestamp the way the history endpoint expects its cursor.
pub fn format_cursor(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp in RFC 3339 form or as a naive ISO-8601 datetime
/// (interpreted as UTC). The backend emits the latter.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

mod timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_cursor(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}
