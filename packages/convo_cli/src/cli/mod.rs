pub mod watch;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use convo_sync::types::parse_timestamp;
use convo_sync::{ConversationApi, ConversationId, LoadKind, MessageCreate, PageCursor};
use tracing::info;

use crate::config::FileConfig;
use crate::format::render_message;

pub use watch::watch_command;

fn parse_before(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        None => Ok(None),
        Some(raw) => match parse_timestamp(raw) {
            Some(ts) => Ok(Some(ts)),
            None => bail!("Invalid --before timestamp {raw:?}; expected e.g. 2024-05-01T12:00:00Z"),
        },
    }
}

/// Print one page of history, oldest to newest.
pub async fn history_command(
    config: &FileConfig,
    conversation: &str,
    before: Option<&str>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let client = config.client()?;
    let before = parse_before(before)?;
    let limit = limit.unwrap_or(config.history.page_size).max(1);
    let cursor = PageCursor {
        kind: if before.is_some() {
            LoadKind::Older
        } else {
            LoadKind::Initial
        },
        before,
        limit,
    };

    let conversation = ConversationId::from(conversation);
    let page = client
        .api()
        .fetch_page(&conversation, &cursor)
        .await
        .with_context(|| format!("Failed to fetch history for {conversation}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    if page.is_empty() {
        println!("No messages.");
        return Ok(());
    }
    if page.len() < limit {
        println!("-- start of conversation --");
    }
    for msg in &page {
        println!("{}", render_message(msg));
    }
    if let Some(oldest) = page.first() {
        println!(
            "\n{} message(s); older: --before {}",
            page.len(),
            convo_sync::types::format_cursor(&oldest.timestamp)
        );
    }
    Ok(())
}

/// Validate and submit a single message.
pub async fn send_command(config: &FileConfig, conversation: &str, content: &str) -> Result<()> {
    let message = MessageCreate::new(content)?;
    let client = config.client()?;
    let conversation = ConversationId::from(conversation);

    let ack = client
        .api()
        .submit(&conversation, message)
        .await
        .with_context(|| format!("Failed to send message to {conversation}"))?;
    info!(message = %ack.id, turn = %ack.turn_id, "message accepted");
    println!("Sent (message {}, turn {}).", ack.id, ack.turn_id);
    Ok(())
}

/// Print the resolved configuration as TOML, token masked.
pub fn config_command(config: &FileConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(&config.redacted()).context("Failed to render config")?;
    print!("{rendered}");
    Ok(())
}
