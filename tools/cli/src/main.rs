//! LimeAura sync CLI - inspect and drive the offline mutation queue.
//!
//! Mutations are queued in a local SQLite database and replayed against the
//! LimeAura REST API whenever the tool runs online.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use limeaura_common::{EntityKind, OperationId, OperationType};
use limeaura_storage::SqliteStore;
use limeaura_sync::{
    Change, ConflictStrategy, Connectivity, CredentialProvider, HttpRemote, NoCredentials,
    OfflineSync, PassOutcome, Resolution, ResolutionOutcome, SkipReason, StaticToken,
    SyncConfig, SyncOperation,
};

type Service = OfflineSync<SqliteStore, HttpRemote>;

#[derive(Parser)]
#[command(name = "limeaura-sync")]
#[command(about = "LimeAura - Offline mutation queue and sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Queue database (default: <data dir>/limeaura/offline.db).
    #[arg(long, global = true, env = "LIMEAURA_DB")]
    db: Option<PathBuf>,

    /// JSON sync configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// API base URL, overrides the configuration file.
    #[arg(long, global = true, env = "LIMEAURA_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the API.
    #[arg(long, global = true, env = "LIMEAURA_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Work offline: queue only, never contact the API.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a mutation. It is sent right away unless offline.
    Enqueue {
        /// Entity kind: task, project or comment.
        #[arg(short, long)]
        entity: EntityKind,

        /// Operation: create, update or delete.
        #[arg(short = 't', long = "type")]
        op_type: OperationType,

        /// Id of the entity being changed.
        #[arg(short, long)]
        id: String,

        /// JSON payload (required for create and update).
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Run one sync pass now.
    Sync,

    /// Show queue counts.
    Status,

    /// List pending and failed operations, oldest first.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List operations waiting for conflict resolution.
    Conflicts {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Resolve one conflicted operation.
    Resolve {
        /// Operation id.
        id: String,

        /// How to resolve the conflict.
        #[arg(short, long, value_enum)]
        action: ResolveAction,

        /// Merged JSON payload (required for merge).
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Resolve every conflict with one policy.
    ResolveAll {
        #[arg(short, long, value_enum)]
        prefer: Prefer,
    },

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResolveAction {
    /// Send the local change again.
    KeepLocal,
    /// Drop the local change.
    AcceptServer,
    /// Send a merged payload instead.
    Merge,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Prefer {
    Local,
    Remote,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "limeaura-sync", &mut std::io::stdout());
        return Ok(());
    }

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    let sync = open_service(&cli).await?;

    let result = match &cli.command {
        Commands::Enqueue {
            entity,
            op_type,
            id,
            data,
        } => cmd_enqueue(&sync, *entity, *op_type, id, data.as_deref()).await,

        Commands::Sync => cmd_sync(&sync).await,

        Commands::Status => cmd_status(&sync).await,

        Commands::List { json } => {
            let operations = sync
                .pending_and_failed()
                .await
                .context("Failed to read queue")?;
            print_operations(&operations, *json, "No pending operations.")
        }

        Commands::Conflicts { json } => {
            let operations = sync.conflicts().await.context("Failed to read queue")?;
            print_operations(&operations, *json, "No conflicts.")
        }

        Commands::Resolve { id, action, data } => {
            cmd_resolve(&sync, id, *action, data.as_deref()).await
        }

        Commands::ResolveAll { prefer } => cmd_resolve_all(&sync, *prefer).await,

        Commands::Completions { .. } => Ok(()),
    };

    // Waits for any pass the command triggered.
    sync.shutdown()
        .await
        .context("Failed to stop sync scheduler")?;

    result
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("limeaura")
        .join("offline.db")
}

/// Open the queue database and start the sync service.
async fn open_service(cli: &Cli) -> Result<Service> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(api_url) = &cli.api_url {
        config.api_base_url = api_url.clone();
    }
    config.validate().context("Invalid sync configuration")?;

    let db_path = cli.db.clone().unwrap_or_else(default_db_path);
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    debug!("Using queue database {}", db_path.display());

    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?,
    );

    let credentials: Arc<dyn CredentialProvider> = match &cli.token {
        Some(token) => Arc::new(StaticToken::new(token.clone())),
        None => Arc::new(NoCredentials),
    };
    let remote = Arc::new(
        HttpRemote::from_config(&config, credentials).context("Failed to create API client")?,
    );

    OfflineSync::start(store, remote, Connectivity::new(!cli.offline), &config)
        .await
        .context("Failed to start offline sync")
}

/// Queue a mutation.
async fn cmd_enqueue(
    sync: &Service,
    entity: EntityKind,
    op_type: OperationType,
    entity_id: &str,
    data: Option<&str>,
) -> Result<()> {
    let payload = data
        .map(|raw| serde_json::from_str(raw).context("--data must be valid JSON"))
        .transpose()?;
    let change = Change::from_parts(entity, op_type, payload)
        .with_context(|| format!("Invalid {} {} payload", op_type, entity))?;

    let op = sync
        .queue_operation(entity_id, change)
        .await
        .context("Failed to queue operation")?;

    info!("Queued {}", op);
    println!("Queued {} {} {}", op.operation_type(), op.entity(), op.entity_id);
    println!("  ID: {}", op.id);

    Ok(())
}

/// Run one pass and print its report.
async fn cmd_sync(sync: &Service) -> Result<()> {
    let mut outcome = sync.sync_now().await.context("Sync pass failed")?;
    if outcome == PassOutcome::Skipped(SkipReason::Busy) {
        // A start-up recovery pass is running; let it finish first.
        sync.shutdown().await?;
        outcome = sync.sync_now().await.context("Sync pass failed")?;
    }

    match outcome {
        PassOutcome::Skipped(SkipReason::Offline) => println!("Offline: nothing sent."),
        PassOutcome::Skipped(SkipReason::Busy) => println!("Another sync pass is running."),
        PassOutcome::Completed(report) if report.attempted == 0 => {
            println!("Nothing to sync.")
        }
        PassOutcome::Completed(report) => {
            println!("Sync completed in {:?}:", report.duration);
            println!("  Synced: {}", report.synced);
            println!("  Conflicts: {}", report.conflicts);
            println!("  Failed: {}", report.failed);
        }
    }

    Ok(())
}

/// Show queue counts.
async fn cmd_status(sync: &Service) -> Result<()> {
    let status = sync.status().await.context("Failed to read queue")?;

    println!("Sync queue:");
    println!("  Pending: {}", status.pending);
    println!("  Syncing: {}", status.syncing);
    println!("  Failed: {}", status.failed);
    println!("  Conflicts: {}", status.conflict);
    println!(
        "  Connectivity: {}",
        if sync.connectivity().is_online() {
            "online"
        } else {
            "offline"
        }
    );

    Ok(())
}

fn print_operations(operations: &[SyncOperation], json: bool, empty: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(operations)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("{}", empty);
        return Ok(());
    }

    for op in operations {
        println!(
            "{}  {:<8} {:<6} {:<7} {}  retries={}  {}",
            op.id,
            op.state,
            op.operation_type(),
            op.entity(),
            op.entity_id,
            op.retries,
            op.created_at.format("%Y-%m-%d %H:%M:%S%.3f")
        );
        if let Some(error) = &op.last_error {
            println!("    last error: {}", error);
        }
    }

    Ok(())
}

/// Resolve one conflict.
async fn cmd_resolve(
    sync: &Service,
    id: &str,
    action: ResolveAction,
    data: Option<&str>,
) -> Result<()> {
    let id = OperationId::new(id).context("Invalid operation id")?;

    let resolution = match action {
        ResolveAction::KeepLocal => Resolution::KeepLocal,
        ResolveAction::AcceptServer => Resolution::AcceptServer,
        ResolveAction::Merge => {
            let raw = data.context("--data is required for merge")?;
            let op = sync
                .get(&id)
                .await?
                .with_context(|| format!("No operation {}", id))?;
            let payload = serde_json::from_str(raw).context("--data must be valid JSON")?;
            let change = Change::from_parts(op.entity(), op.operation_type(), Some(payload))
                .context("Invalid merged payload")?;
            Resolution::Merge(change)
        }
    };

    match sync
        .resolve_conflict(&id, resolution)
        .await
        .context("Failed to resolve conflict")?
    {
        ResolutionOutcome::Requeued(op) => println!("Requeued {}", op),
        ResolutionOutcome::Discarded => println!("Discarded {}", id),
    }

    Ok(())
}

/// Resolve every conflict with one policy.
async fn cmd_resolve_all(sync: &Service, prefer: Prefer) -> Result<()> {
    let strategy = match prefer {
        Prefer::Local => ConflictStrategy::PreferLocal,
        Prefer::Remote => ConflictStrategy::PreferRemote,
    };

    let summary = sync
        .resolve_conflicts_with(&strategy)
        .await
        .context("Failed to resolve conflicts")?;

    println!("Conflicts resolved:");
    println!("  Requeued: {}", summary.requeued);
    println!("  Discarded: {}", summary.discarded);
    if summary.unresolved > 0 {
        println!("  Unresolved: {}", summary.unresolved);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "limeaura-sync",
            "--offline",
            "enqueue",
            "--entity",
            "tasks",
            "--type",
            "update",
            "--id",
            "t-1",
            "--data",
            r#"{"title":"x"}"#,
        ])
        .unwrap();

        assert!(cli.offline);
        match cli.command {
            Commands::Enqueue {
                entity, op_type, id, ..
            } => {
                assert_eq!(entity, EntityKind::Task);
                assert_eq!(op_type, OperationType::Update);
                assert_eq!(id, "t-1");
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_parse_resolve_merge() {
        let cli = Cli::try_parse_from([
            "limeaura-sync",
            "resolve",
            "op-1",
            "--action",
            "merge",
            "--data",
            "{}",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Resolve {
                action: ResolveAction::Merge,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_entity_rejected() {
        let result = Cli::try_parse_from([
            "limeaura-sync",
            "enqueue",
            "-e",
            "widget",
            "-t",
            "create",
            "-i",
            "w-1",
        ]);
        assert!(result.is_err());
    }
}
