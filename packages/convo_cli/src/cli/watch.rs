use anyhow::{Context, Result};
use convo_sync::{
    AnchorDirective, EngineError, EngineEvent, EngineHandle, FetchRefused, LoadKind, SubmitError,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::config::FileConfig;
use crate::format::{Transcript, render_message, render_notice, render_status, render_turn};

/// A line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Older,
    Reconnect,
    Quit,
    Help,
    Empty,
    Message(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Input::Empty,
            "/older" => Input::Older,
            "/reconnect" => Input::Reconnect,
            "/quit" | "/exit" => Input::Quit,
            "/help" => Input::Help,
            _ => Input::Message(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }
}

const HELP: &str = "/older      load older history\n\
                    /reconnect  reopen the conversation\n\
                    /quit       exit\n\
                    anything else is sent as a message";

struct Session {
    engine: EngineHandle,
    conversation: String,
    transcript: Transcript,
}

impl Session {
    fn print_unseen(&mut self) {
        let snapshot = self.engine.snapshot();
        for msg in self.transcript.unseen(&snapshot.messages) {
            println!("{}", render_message(msg));
        }
    }

    fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connection(state) => println!("{}", render_status(state)),
            EngineEvent::Appended(msg) => {
                if self.transcript.mark(&msg) {
                    println!("{}", render_message(&msg));
                }
            }
            EngineEvent::PageLoaded {
                kind,
                inserted,
                has_more,
            } => {
                if kind == LoadKind::Older && inserted > 0 {
                    println!("-- {inserted} older message(s) --");
                }
                self.print_unseen();
                if !has_more {
                    println!("-- start of conversation --");
                }
            }
            EngineEvent::Anchor(AnchorDirective::Center { message_id }) => {
                let snapshot = self.engine.snapshot();
                if let Some(msg) = snapshot.messages.iter().find(|m| m.id == message_id) {
                    println!(">> relevant: {}", render_message(msg));
                }
            }
            EngineEvent::Anchor(directive) => debug!(?directive, "anchor"),
            EngineEvent::HighlightCleared(id) => debug!(message = %id, "highlight cleared"),
            EngineEvent::Turn(state) => println!("{}", render_turn(state)),
            EngineEvent::Notice(notice) => println!("{}", render_notice(&notice)),
        }
    }

    async fn on_input(&mut self, input: Input) -> Result<bool> {
        match input {
            Input::Quit => return Ok(false),
            Input::Empty => {}
            Input::Help => println!("{HELP}"),
            Input::Older => match self.engine.load_older().await {
                Ok(()) => {}
                Err(EngineError::History(FetchRefused::Exhausted)) => {
                    println!("-- no older messages --")
                }
                Err(EngineError::History(FetchRefused::InFlight)) => {
                    println!("-- already loading --")
                }
                Err(err) => return Err(err).context("Engine stopped"),
            },
            Input::Reconnect => {
                self.transcript.reset();
                self.engine.open(self.conversation.as_str()).await?;
            }
            Input::Message(text) => match self.engine.submit(text).await {
                Ok(ack) => debug!(message = %ack.id, "submitted"),
                Err(SubmitError::Engine(err)) => return Err(err).context("Engine stopped"),
                Err(err) => println!("-- not sent: {err} --"),
            },
        }
        Ok(true)
    }
}

/// Open a conversation and stay attached: print history and live messages,
/// send what is typed.
pub async fn watch_command(config: &FileConfig, conversation: &str) -> Result<()> {
    let client = config.client()?;
    let engine = client
        .spawn_engine(config.view_config())
        .context("Failed to set up relevance oracle client")?;
    let mut events = engine.subscribe();
    engine.open(conversation).await?;

    let mut session = Session {
        engine: engine.clone(),
        conversation: conversation.to_string(),
        transcript: Transcript::default(),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => session.on_event(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "fell behind on conversation events");
                    session.print_unseen();
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if !session.on_input(Input::parse(&line)).await? {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = engine.shutdown().await;
    Ok(())
}
