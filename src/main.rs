//! Convo CLI entry point.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use futures::StreamExt as _;
use std::io::Write as _;
use std::sync::Arc;

use convo::advisor::AdvisorChain;
use convo::config::Config;
use convo::conversation::{ConversationMemory, MemoryRepository, QueryDialect};
use convo::llm::OpenAiCompatibleModel;
use convo::ConversationService;

#[derive(Parser)]
#[command(name = "convo")]
#[command(about = "Streaming chat with per-conversation memory")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message and stream the reply
    Chat {
        #[arg(short = 'c', long)]
        conversation: String,
        /// Message text
        text: Vec<String>,
    },
    /// Print a conversation's stored history
    History {
        #[arg(short = 'c', long)]
        conversation: String,
    },
    /// Delete a conversation's history
    Delete {
        #[arg(short = 'c', long)]
        conversation: String,
    },
    /// List known conversation ids
    Conversations,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    convo::telemetry::init_tracing(cli.debug);

    let config = Config::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to load configuration".to_string(),
    })?;

    if let Command::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    let (service, db) = build_service(&config).await?;

    let outcome = run(&service, cli.command).await;

    if let Some(db) = db {
        db.close().await;
    }
    outcome
}

async fn build_service(
    config: &Config,
) -> anyhow::Result<(ConversationService, Option<convo::db::Db>)> {
    let (memory, db) = if config.memory.persist {
        let url = config.database_url()?;
        let db = convo::db::Db::connect(&url, config.database.max_connections)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;

        let dialect = QueryDialect::sqlite(&config.database.table)?;
        let repository = MemoryRepository::new(db.sqlite.clone(), dialect);
        repository
            .initialize()
            .await
            .context("failed to initialize history table")?;

        (
            ConversationMemory::persistent(config.memory.window_size(), repository),
            Some(db),
        )
    } else {
        (ConversationMemory::ephemeral(config.memory.window_size()), None)
    };

    let memory = memory.with_max_cached_conversations(config.memory.max_cached_conversations);

    let model = OpenAiCompatibleModel::new(&config.llm).context("failed to build model client")?;
    let service = ConversationService::new(
        Arc::new(memory),
        AdvisorChain::from_config(&config.advisors),
        Arc::new(model),
    )
    .with_system_prompt(config.system_prompt()?)
    .with_fragment_timeout(config.fragment_timeout());

    tracing::debug!(?service, "service ready");
    Ok((service, db))
}

async fn run(service: &ConversationService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Chat { conversation, text } => {
            let text = text.join(" ");
            let mut stream = service.submit(&conversation, &text).await?;
            let cancel = stream.cancellation_token();

            let mut stdout = std::io::stdout();
            loop {
                let next = tokio::select! {
                    next = stream.next() => Some(next),
                    _ = tokio::signal::ctrl_c() => None,
                };
                let Some(next) = next else {
                    cancel.cancel();
                    continue;
                };
                match next {
                    Some(Ok(fragment)) => {
                        write!(stdout, "{fragment}")?;
                        stdout.flush()?;
                    }
                    Some(Err(error)) => {
                        writeln!(stdout)?;
                        return Err(error).context("chat failed");
                    }
                    None => break,
                }
            }
            writeln!(stdout)?;
        }
        Command::History { conversation } => {
            for message in service.list_history(&conversation).await? {
                println!("{}: {}", message.role(), message.text());
            }
        }
        Command::Delete { conversation } => {
            service.delete_history(&conversation).await?;
            println!("deleted {conversation}");
        }
        Command::Conversations => {
            let mut ids = service.list_conversation_ids().await?;
            ids.sort();
            for id in ids {
                println!("{id}");
            }
        }
        Command::Config => {}
    }

    Ok(())
}
