use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};
use chat_update::LogLevel;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use waystation::{
    config::{ConfigManager, EnvConfigManager, FlowConfig},
    demo::{self, ReplayLine},
    dispatcher::UpdateDispatcher,
    logger::init_tracing,
    schema::write_schema,
};

#[derive(Parser, Debug)]
#[command(
    name = "waystation",
    about = "Conversation flow control for chat bots",
    version
)]
struct Cli {
    /// `.env` file with WAYSTATION_* settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a JSON-lines file of updates through the demo bot
    Replay(ReplayArgs),

    /// Print the effective configuration, or change one setting
    Config(ConfigArgs),

    /// Emit JSON-Schema for updates, continuations, journeys, reports and config
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// One update per line, either a full update or `{"chat": .., "text": ..}`
    file: PathBuf,

    /// Overrides WAYSTATION_LOG_LEVEL (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Also write rolling log files here
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Store a WAYSTATION_* setting in the `.env` file
    Set { key: String, value: String },
    /// Remove a WAYSTATION_* setting from the `.env` file
    Unset { key: String },
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_mgr = ConfigManager(EnvConfigManager::new(cli.env_file.clone()));

    match cli.command {
        Commands::Replay(args) => replay(args, FlowConfig::load(&config_mgr).await?).await,
        Commands::Config(args) => match args.action {
            None => {
                let config = FlowConfig::load(&config_mgr).await?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            Some(ConfigAction::Set { key, value }) => {
                FlowConfig::store(&config_mgr, &key, &value).await?;
                info!(key = %key, "setting stored");
                Ok(())
            }
            Some(ConfigAction::Unset { key }) => {
                FlowConfig::forget(&config_mgr, &key).await?;
                info!(key = %key, "setting removed");
                Ok(())
            }
        },
        Commands::Schema(args) => {
            for path in write_schema(&args.out)? {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

async fn replay(args: ReplayArgs, mut config: FlowConfig) -> anyhow::Result<()> {
    if let Some(level) = args.log_level.as_deref() {
        config.log_level = LogLevel::from_str(level).with_context(|| format!("unknown log level `{}`", level))?;
    }
    let logger = init_tracing(args.log_dir.clone(), config.log_level)?;

    if !args.file.exists() {
        bail!("replay file `{}` does not exist", args.file.display());
    }
    let content = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;

    let dispatcher = UpdateDispatcher::new(demo::bot(&config, logger)?, &config);
    info!(file = %args.file.display(), "replay starting");

    let mut failed = 0;
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let update = serde_json::from_str::<ReplayLine>(line)
            .with_context(|| format!("line {}: not an update", number + 1))?
            .into_update();

        match dispatcher.dispatch(update).await {
            Ok(report) => println!("{}", serde_json::to_string(&report)?),
            Err(err) => {
                failed += 1;
                error!(line = number + 1, error = %err, "update failed");
                eprintln!("line {}: {}", number + 1, err);
            }
        }
    }

    info!(failed, "replay finished");
    if failed > 0 {
        bail!("{} update(s) failed", failed);
    }
    Ok(())
}
