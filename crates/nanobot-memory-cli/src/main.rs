use anyhow::Result;
use clap::{Parser, Subcommand};
use nanobot_memory_core::paths::resolve_nanobot_home;
use nanobot_memory_core::service::{MemoryService, disable_at, enable_at, status_at};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nanobot-memory")]
#[command(about = "Manage nanobot's remote memory synchronization")]
struct Cli {
    #[arg(long, global = true, help = "nanobot home (defaults to $NANOBOT_HOME or ~/.nanobot)")]
    home: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = false)]
    human: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Show configuration, credential presence and migration records")]
    Status,
    #[command(about = "Enable remote memory, optionally storing the API key")]
    Enable {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value_t = false, help = "Migrate local conversations right away")]
        migrate: bool,
    },
    Disable,
    #[command(about = "Migrate local conversations that have not been transferred yet")]
    Migrate,
    #[command(about = "Print the context the next prompt for a conversation would receive")]
    Context {
        key: String,
        #[arg(long)]
        tokens: Option<u32>,
    },
    #[command(about = "Replay exchanges queued locally while the backend was unreachable")]
    Reconcile { key: String },
    #[command(about = "Ask the backend a question about the user of a conversation")]
    Ask { key: String, query: String },
}

fn render_human(value: &Value) -> String {
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return format!("Error: {error}");
    }

    if let Some(text) = value
        .get("data")
        .and_then(|data| data.get("rendered").or_else(|| data.get("answer")))
        .and_then(Value::as_str)
    {
        return text.to_string();
    }

    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Command, home: PathBuf) -> Result<Value> {
    match command {
        Command::Status => status_at(&home),
        Command::Enable { api_key, migrate } => {
            let enabled = enable_at(&home, api_key.as_deref())?;
            let credential = enabled
                .pointer("/data/credential_present")
                .and_then(Value::as_bool)
                == Some(true);
            if !migrate || !credential {
                return Ok(enabled);
            }
            MemoryService::new_with_home(&home)?.migrate_all().await
        }
        Command::Disable => disable_at(&home),
        Command::Migrate => MemoryService::new_with_home(&home)?.migrate_all().await,
        Command::Context { key, tokens } => {
            MemoryService::new_with_home(&home)?
                .context(&key, tokens)
                .await
        }
        Command::Reconcile { key } => MemoryService::new_with_home(&home)?.reconcile(&key).await,
        Command::Ask { key, query } => {
            MemoryService::new_with_home(&home)?
                .ask(&key, &query)
                .await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let home = cli.home.unwrap_or_else(resolve_nanobot_home);

    let output = run(cli.command, home).await?;

    if cli.human {
        println!("{}", render_human(&output));
    } else {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    if output.get("ok").and_then(Value::as_bool) == Some(false) {
        std::process::exit(1);
    }

    Ok(())
}
