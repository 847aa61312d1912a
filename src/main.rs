mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedpull::config::LoggingConfig;
use feedpull::models::ScheduleRequestType;

#[derive(Parser)]
#[command(
    name = "feedpull",
    version,
    about = "Adaptive RSS/Atom feed puller",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides `[logging] format`
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to the manager and pull feeds until Ctrl-C
    Run {
        /// TOML config file; environment variables are used without it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Name reported to the manager on login
        #[arg(long)]
        name: Option<String>,
    },

    /// Load and validate a config file
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Compute the next request time of a stored feed record
    Replay {
        /// Feed record as JSON
        #[arg(short, long)]
        record: PathBuf,

        /// Current time in epoch seconds
        #[arg(long)]
        now: Option<i64>,

        /// Request type (first, regular, skipped)
        #[arg(long = "type", default_value = "regular")]
        request_type: ScheduleRequestType,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Run { config, .. }
        | Commands::CheckConfig { config }
        | Commands::Replay { config, .. } => config.clone(),
    };
    let config = commands::load_config(config_path.as_deref())?;

    setup_tracing(&config.logging, cli.log_format.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Run { name, .. } => {
            commands::run(config, name).await?;
        }

        Commands::CheckConfig { .. } => {
            commands::check_config(&config)?;
        }

        Commands::Replay {
            record,
            now,
            request_type,
            ..
        } => {
            tracing::debug!(record = %record.display(), now = ?now, "Starting replay command");
            commands::replay(&config, &record, now, request_type)?;
        }
    }

    Ok(())
}

fn setup_tracing(logging: &LoggingConfig, format: Option<&str>, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("feedpull=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("feedpull={},warn", logging.level))
        })
    };

    match format.unwrap_or(logging.format.as_str()) {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}
