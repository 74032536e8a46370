use benebot::agent::dispatch::{self, Dispatcher};
use benebot::agent::Agent;
use benebot::capabilities;
use benebot::comm::{InboundMessage, MessagingSink, Sender, StdoutSink};
use benebot::config::{CapabilitiesConfig, Config};
use benebot::telegram::TelegramClient;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "benebot", version, about = "Telegram assistant backed by Gemini")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bot (default)
    Start,
    /// Validate the configuration and print a summary
    CheckConfig,
    /// Print the capability declarations sent to the model
    Capabilities,
    /// Run one conversational turn and print the reply
    Ask {
        /// Conversation id to use
        #[arg(long, default_value_t = 0)]
        chat: i64,
        /// Sender display name
        #[arg(long, default_value = "anonymous")]
        name: String,
        /// Message text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

async fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = Config::locate(explicit)?;
    info!(path = %path.display(), "loading configuration");
    Config::load(&path).await
}

async fn check_config(explicit: Option<&Path>) -> anyhow::Result<()> {
    let cfg = load_config(explicit).await?;
    let registry = capabilities::builtin_registry(&cfg.capabilities, cfg.bot.request_timeout())?;
    println!("configuration OK");
    println!("  model:               {}", cfg.bot.model);
    println!("  max_history:         {}", cfg.bot.max_history);
    println!("  max_tool_iterations: {}", cfg.bot.max_tool_iterations);
    println!("  request_timeout:     {}s", cfg.bot.request_timeout_secs);
    println!("  mock_chance:         {}", cfg.bot.mock_chance);
    println!("  grammar check ids:   {}", cfg.bot.unintelligible_ids.len());
    println!("  capabilities:        {}", registry.names().join(", "));
    Ok(())
}

fn print_capabilities() -> anyhow::Result<()> {
    let registry =
        capabilities::builtin_registry(&CapabilitiesConfig::default(), Duration::from_secs(10))?;
    let json = serde_json::to_string_pretty(&registry.declarations())
        .context("failed to serialise capability declarations")?;
    println!("{json}");
    Ok(())
}

async fn ask(explicit: Option<&Path>, chat: i64, name: String, text: String) -> anyhow::Result<()> {
    let cfg = load_config(explicit).await?;
    let sink: Arc<dyn MessagingSink> = Arc::new(StdoutSink::new());
    let agent = Agent::from_config(&cfg, sink)?;
    let msg = InboundMessage::text(
        chat,
        1,
        Some(Sender {
            id: 0,
            first_name: name,
            username: None,
        }),
        &text,
    );
    let report = agent.run_turn(&msg, &CancellationToken::new()).await?;
    info!(
        outcome = ?report.outcome,
        model_calls = report.model_calls,
        capability_calls = report.tool_calls.len(),
        duration_ms = report.duration_ms,
        "turn finished"
    );
    Ok(())
}

async fn run_bot(explicit: Option<&Path>) -> anyhow::Result<()> {
    let cfg = load_config(explicit).await?;

    let telegram = Arc::new(TelegramClient::new(
        &cfg.keys.telegram,
        &cfg.api.telegram_url,
        cfg.bot.request_timeout(),
    )?);
    let bot = telegram
        .get_me()
        .await
        .context("failed to fetch bot identity from Telegram")?;
    info!(bot_id = bot.id, username = %bot.username, "connected to Telegram");

    let sink: Arc<dyn MessagingSink> = telegram.clone();
    let agent = Arc::new(Agent::from_config(&cfg, sink)?);
    info!(
        model = %cfg.bot.model,
        capabilities = agent.registry().len(),
        max_history = cfg.bot.max_history,
        "benebot ready"
    );
    let dispatcher = Arc::new(Dispatcher::new(agent, bot, cfg.bot.clone()));

    // Create a shutdown cancellation token.
    let cancel = CancellationToken::new();

    let poller = {
        let telegram = Arc::clone(&telegram);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            telegram
                .poll(&cancel, |msg| {
                    let _ = dispatcher.spawn(msg, cancel.clone());
                })
                .await;
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("received Ctrl-C, shutting down…");

    // 1. Stop polling and interrupt in-flight model/capability calls.
    cancel.cancel();
    if let Err(e) = poller.await {
        warn!(error = %e, "polling task ended abnormally");
    }

    // 2. Wait for in-flight message tasks to finish.
    let in_flight = dispatch::in_flight_count();
    if in_flight > 0 {
        info!(in_flight, "waiting for in-flight turns to drain…");
    }
    dispatch::drain_in_flight(Duration::from_secs(10)).await;

    info!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => run_bot(config).await,
        Command::CheckConfig => check_config(config).await,
        Command::Capabilities => print_capabilities(),
        Command::Ask { chat, name, text } => ask(config, chat, name, text.join(" ")).await,
    }
}
