//! Context Tree Maintenance Binary
//!
//! Runs the batch maintenance operations against a context database, the way
//! a scheduled task would.
//!
//! # Usage
//!
//! ```bash
//! # Create nodes for instance rows that have none
//! cargo run --bin context-maint -- create-missing
//! cargo run --bin context-maint -- create-missing --max-level 50
//!
//! # Rebuild unbuilt paths, or every path with --force
//! cargo run --bin context-maint -- rebuild
//! cargo run --bin context-maint -- rebuild --force --level cohort
//!
//! # Remove nodes whose instance row is gone
//! cargo run --bin context-maint -- cleanup
//! ```
//!
//! # Configuration
//!
//! - `--config` / `CONTEXTSPACE_CONFIG`: JSON configuration file (default: built-in defaults)
//! - `--db` / `CONTEXTSPACE_DB`: Database file, overrides the configured path
//! - `RUST_LOG`: Logging level (e.g., "info", "debug", "trace")

use std::env;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use contextspace_core::{
    ContextConfig, ContextLevel, ContextService, ContextServiceError, HandlerCatalog,
};

#[derive(Parser, Debug)]
#[command(name = "context-maint", about = "Context tree maintenance")]
struct Cli {
    /// JSON configuration file (falls back to CONTEXTSPACE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overrides the configured path (falls back to CONTEXTSPACE_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create nodes for instance rows that have none
    CreateMissing {
        /// Skip levels above this one (number or short name)
        #[arg(long)]
        max_level: Option<String>,
    },

    /// Rebuild unbuilt paths, or every path with --force
    Rebuild {
        #[arg(long)]
        force: bool,

        /// Only rebuild this level (number or short name)
        #[arg(long)]
        level: Option<String>,
    },

    /// Remove nodes whose instance row is gone
    Cleanup,
}

fn load_config(cli: &Cli) -> anyhow::Result<ContextConfig> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| env::var("CONTEXTSPACE_CONFIG").ok().map(PathBuf::from));

    let mut config = match config_path {
        Some(path) => ContextConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ContextConfig::default(),
    };

    if let Some(db) = cli
        .db
        .clone()
        .or_else(|| env::var("CONTEXTSPACE_DB").ok().map(PathBuf::from))
    {
        config.database_path = db;
    }
    Ok(config)
}

fn resolve_level(service: &ContextService, token: &str) -> anyhow::Result<ContextLevel> {
    service
        .registry()
        .resolve_level(token)
        .ok_or_else(|| ContextServiceError::UnknownLevelReference(token.to_string()).into())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing::info!("Database: {}", config.database_path.display());

    let service = ContextService::open(config, &HandlerCatalog::builtin(), None).await?;

    match cli.command {
        Command::CreateMissing { max_level } => {
            let max_level = match max_level {
                Some(token) => Some(resolve_level(&service, &token)?),
                None => None,
            };
            let created = service.create_missing_instances(max_level).await?;
            tracing::info!("create-missing: {} contexts created", created);
        }
        Command::Rebuild { force, level } => {
            let updated = match level {
                Some(token) => {
                    let level = resolve_level(&service, &token)?;
                    service.rebuild_paths(level, force).await?
                }
                None => service.rebuild_all(force).await?,
            };
            tracing::info!("rebuild: {} paths updated", updated);
        }
        Command::Cleanup => {
            let removed = service.cleanup_orphans().await?;
            for node in &removed {
                tracing::debug!(
                    "Removed orphan context {} (level {}, instance {})",
                    node.id(),
                    node.level(),
                    node.instance_id()
                );
            }
            tracing::info!("cleanup: {} orphaned contexts removed", removed.len());
        }
    }

    service.close().await;
    Ok(())
}
