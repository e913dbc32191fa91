//! Plain-text rendering of conversation messages for the terminal.

use convo_sync::{ConnectionState, Message, Notice, Sender, TurnState};
use std::collections::HashSet;

const MAX_ARGS_CHARS: usize = 120;

pub fn sender_label(msg: &Message) -> String {
    match msg.sender() {
        Sender::User => "you".to_string(),
        Sender::Orchestrator | Sender::Agent => msg.sender_alias.clone(),
        Sender::Tool => format!("tool:{}", msg.sender_alias),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

pub fn render_message(msg: &Message) -> String {
    let mut out = format!(
        "[{}] {}: {}",
        msg.timestamp.format("%H:%M:%S"),
        sender_label(msg),
        msg.content.trim_end()
    );
    for call in msg.tool_calls() {
        out.push_str(&format!(
            "\n    -> {}({})",
            call.name,
            truncate(&call.args.to_string(), MAX_ARGS_CHARS)
        ));
    }
    out
}

pub fn render_status(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connecting => "-- connecting --",
        ConnectionState::Connected => "-- connected --",
        ConnectionState::Disconnected => "-- disconnected --",
    }
}

pub fn render_turn(state: TurnState) -> &'static str {
    match state {
        TurnState::Active => "-- agents are working; input is paused --",
        TurnState::Idle => "-- your turn --",
    }
}

pub fn render_notice(notice: &Notice) -> String {
    match notice {
        Notice::ConnectionLost(Some(err)) => {
            format!("-- connection lost: {err} (type /reconnect to retry) --")
        }
        Notice::ConnectionLost(None) => {
            "-- server closed the connection (type /reconnect to retry) --".to_string()
        }
        Notice::HistoryFailed(err) => format!("-- could not load history: {err} --"),
    }
}

/// Remembers which messages have been written so each is printed once,
/// however many times it shows up in snapshots and events.
#[derive(Debug, Default)]
pub struct Transcript {
    printed: HashSet<String>,
}

impl Transcript {
    /// Messages from `messages` not printed yet, in order, marking them printed.
    pub fn unseen<'a>(&mut self, messages: &'a [Message]) -> Vec<&'a Message> {
        messages
            .iter()
            .filter(|m| self.printed.insert(m.id.clone()))
            .collect()
    }

    pub fn mark(&mut self, msg: &Message) -> bool {
        self.printed.insert(msg.id.clone())
    }

    pub fn reset(&mut self) {
        self.printed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, sender: &str, content: &str, meta: Option<serde_json::Value>) -> Message {
        let mut json = serde_json::json!({
            "id": id,
            "group_id": "g-1",
            "turn_id": "t-1",
            "sender_alias": sender,
            "content": content,
            "timestamp": "2024-05-01T09:05:07",
        });
        if let Some(meta) = meta {
            json["meta"] = meta;
        }
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn renders_senders() {
        assert_eq!(
            render_message(&message("1", "User", "hello\n", None)),
            "[09:05:07] you: hello"
        );
        assert_eq!(
            render_message(&message("2", "Orchestrator", "@Coder go", None)),
            "[09:05:07] Orchestrator: @Coder go"
        );
        assert_eq!(
            render_message(&message("3", "web_search", "3 results", None)),
            "[09:05:07] tool:web_search: 3 results"
        );
    }

    #[test]
    fn renders_tool_calls() {
        let meta = serde_json::json!({"kwargs": {"tool_calls": [
            {"name": "web_search", "args": {"query": "rust"}}
        ]}});
        let rendered = render_message(&message("1", "Researcher", "searching", Some(meta)));
        assert_eq!(
            rendered,
            "[09:05:07] Researcher: searching\n    -> web_search({\"query\":\"rust\"})"
        );
    }

    #[test]
    fn truncates_long_args() {
        let long = "x".repeat(500);
        let out = truncate(&long, 10);
        assert_eq!(out, "xxxxxxx...");
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn transcript_prints_each_message_once() {
        let mut transcript = Transcript::default();
        let a = message("a", "Coder", "one", None);
        let b = message("b", "Coder", "two", None);

        assert!(transcript.mark(&a));
        let batch = vec![a.clone(), b.clone()];
        let unseen = transcript.unseen(&batch);
        assert_eq!(unseen.len(), 1);
        assert_eq!(unseen[0].id, "b");
        assert!(transcript.unseen(&batch).is_empty());

        transcript.reset();
        assert_eq!(transcript.unseen(&batch).len(), 2);
    }

    #[test]
    fn notices_mention_reconnect() {
        let text = render_notice(&Notice::ConnectionLost(None));
        assert!(text.contains("/reconnect"));
    }
}
