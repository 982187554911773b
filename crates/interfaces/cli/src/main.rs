//! Process entry point: a `clap`-derived `start` / `run` / `doctor` surface,
//! distinct from the in-band `/`-prefixed Command Router (§4.E), which
//! operates on channel messages rather than process argv.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dotagent_bus::{ChannelSink, InboundEnvelope, OutboundEnvelope};
use dotagent_config::AppConfig;
use dotagent_discord::DiscordAdapter;
use dotagent_runtime::AgentRuntime;

#[derive(Debug, Parser)]
#[command(name = "dotagent", version, about = "A persistent memory-centric AI agent")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the foreground dispatch loop across all enabled channels.
    Start,
    /// Process a single message locally and print the reply.
    Run {
        message: String,
        #[arg(long, default_value = "cli")]
        channel: String,
    },
    /// Check configuration and connectivity.
    Doctor,
}

/// Delivers "cli"-channel replies to stdout.
struct CliSink;

#[async_trait::async_trait]
impl ChannelSink for CliSink {
    fn channel_name(&self) -> &str {
        "cli"
    }

    async fn deliver(&self, envelope: &OutboundEnvelope) -> Result<()> {
        println!("{}", envelope.content);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => run_start(config).await,
        Commands::Run { message, channel } => run_once(config, &channel, &message).await,
        Commands::Doctor => run_doctor(config).await,
    }
}

async fn run_once(config: AppConfig, channel: &str, message: &str) -> Result<()> {
    let runtime = AgentRuntime::bootstrap(config)?;
    let reply = runtime.dispatch(channel, "local", "local", message, false).await?;
    println!("{reply}");
    Ok(())
}

async fn run_doctor(config: AppConfig) -> Result<()> {
    let runtime = AgentRuntime::bootstrap(config)?;
    for line in runtime.doctor().await {
        println!("{line}");
    }
    Ok(())
}

async fn run_start(config: AppConfig) -> Result<()> {
    let discord_enabled = config.channels.enabled.iter().any(|c| c == "discord")
        && !config.channels.discord_bot_token.is_empty()
        && !config.channels.discord_channel_id.is_empty();
    let discord_adapter = discord_enabled.then(|| {
        DiscordAdapter::new(config.channels.discord_bot_token.clone(), config.channels.discord_channel_id.clone())
    });

    let runtime = AgentRuntime::bootstrap(config)?;

    let mut sinks: Vec<Arc<dyn ChannelSink>> = vec![Arc::new(CliSink)];
    let mut handles = vec![runtime.spawn_inbound_worker()];

    if let Some(adapter) = discord_adapter {
        sinks.push(Arc::new(adapter.clone()));
        let bus = runtime.bus.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = adapter.poll_inbound(bus).await {
                tracing::error!(%err, "discord poll loop exited");
            }
        }));
    }

    handles.push(runtime.spawn_outbound_worker(sinks));
    handles.push(spawn_stdin_reader(runtime.clone()));

    println!("dotagent started. Type a message and press enter (Ctrl-D to quit).");
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Reads stdin line-by-line and feeds each line into the bus as the "cli"
/// channel, exactly like any other adapter (§6.1).
fn spawn_stdin_reader(runtime: AgentRuntime) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin());
        use tokio::io::AsyncBufReadExt;
        let mut buf = String::new();
        loop {
            print!("> ");
            let _ = std::io::stdout().flush();
            buf.clear();
            let n = match lines.read_line(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(%err, "stdin read failed");
                    break;
                }
            };
            if n == 0 {
                runtime.orchestrator.stop();
                break;
            }
            let text = buf.trim();
            if text.is_empty() {
                continue;
            }
            runtime.bus.publish_inbound(InboundEnvelope {
                channel: "cli".to_string(),
                sender_id: "local".to_string(),
                chat_id: "local".to_string(),
                content: text.to_string(),
                media: Vec::new(),
                session_key: None,
                metadata: Default::default(),
            });
        }
    })
}
