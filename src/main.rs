//! odoo-backup binary entry point

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use odoo_backup::{
    BackupRun,
    auth::SessionMode,
    config::{self, AppConfig},
    error::AppError,
    metrics,
    storage::RetentionManager,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_BIN_NAME"), version, rename_all = "kebab-case")]
struct Args {
    #[arg(
        long,
        short,
        global = true,
        default_value = config::DEFAULT_CONFIG_PATH,
        help = "Specify the config file path to use"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export, upload and prune once (default)
    Run {
        /// Fall back to the browser authorization flow when no credential is stored
        #[arg(long)]
        interactive: bool,
    },
    /// Authorize Google Drive access and store the credential
    Authorize,
    /// Only remove local backups older than the retention window
    Prune,
}

/// Application entry point
///
/// # Setup
/// 1. Parse arguments
/// 2. Load configuration (missing file is fatal)
/// 3. Initialize tracing/logging and metrics
/// 4. Dispatch the subcommand and map its error to an exit code
#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            init_tracing("info", "pretty");
            tracing::error!(error = %error, "Failed to load configuration");
            return ExitCode::from(&error);
        }
    };

    init_tracing(&config.logging.level, &config.logging.format);
    metrics::init_metrics();

    tracing::info!(
        config = %args.config.display(),
        database = %config.odoo.database_name,
        backup_dir = %config.backup.backup_dir.display(),
        "Configuration loaded"
    );

    let command = args.command.unwrap_or(Command::Run { interactive: false });
    match dispatch(command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, exit_code = error.exit_code(), "odoo-backup failed");
            ExitCode::from(&error)
        }
    }
}

async fn dispatch(command: Command, config: AppConfig) -> Result<(), AppError> {
    match command {
        Command::Run { interactive } => {
            let mode = if interactive {
                SessionMode::Interactive
            } else {
                SessionMode::Unattended
            };
            let run = BackupRun::new(config)?;
            run.execute(mode).await?;
        }
        Command::Authorize => {
            let run = BackupRun::new(config)?;
            run.authorize().await?;
            tracing::info!("Google Drive authorization complete");
        }
        Command::Prune => {
            let report = RetentionManager::from_config(&config).prune().await?;
            metrics::PRUNED_FILES_TOTAL.inc_by(report.removed_count() as u64);
            metrics::PRUNE_FAILURES_TOTAL.inc_by(report.failures.len() as u64);
            if let Some(path) = &config.metrics.textfile_path {
                metrics::write_textfile(path)?;
            }
        }
    }
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("odoo_backup={level}").into());

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}
