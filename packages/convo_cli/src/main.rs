use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

mod cli;
mod config;
mod format;

use crate::config::ConvoConfig;

#[derive(Parser)]
#[command(name = "convo")]
#[command(about = "Follow and take part in a live multi-agent conversation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.convo)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Auth token (overrides [auth] token in config.toml)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a conversation, print it and follow new messages
    Watch(WatchArgs),

    /// Print one page of history
    History(HistoryArgs),

    /// Send a single message
    Send(SendArgs),

    /// Print the resolved configuration
    Config,
}

#[derive(Parser)]
struct WatchArgs {
    /// Conversation (group) id
    conversation: String,
}

#[derive(Parser)]
struct HistoryArgs {
    /// Conversation (group) id
    conversation: String,

    /// Only messages strictly older than this timestamp
    #[arg(long)]
    before: Option<String>,

    /// Page size (defaults to [history] page_size)
    #[arg(short, long)]
    limit: Option<usize>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct SendArgs {
    /// Conversation (group) id
    conversation: String,

    /// Message text
    content: String,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "convo=debug,convo_sync=debug,info"
    } else {
        "convo=info,convo_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let paths = ConvoConfig::new(cli.data_dir)?;
    let config = paths.resolve(cli.token)?;
    debug!(api = %config.server.api_url, ws = %config.server.ws_url, "configuration loaded");

    match cli.command {
        Commands::Watch(args) => cli::watch_command(&config, &args.conversation).await,
        Commands::History(args) => {
            cli::history_command(
                &config,
                &args.conversation,
                args.before.as_deref(),
                args.limit,
                args.json,
            )
            .await
        }
        Commands::Send(args) => cli::send_command(&config, &args.conversation, &args.content).await,
        Commands::Config => cli::config_command(&config),
    }
}
