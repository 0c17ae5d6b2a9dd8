//! FieldSync CLI - inspect and drive the offline sync queue.
//!
//! State lives in a data directory: a JSON snapshot of the local store, a
//! JSON snapshot of the simulated server and a SQLite checkpoint database.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fieldsync_common::EntityKind;
use fieldsync_remote::MemoryRemote;
use fieldsync_storage::model::{EquipmentBody, LocationBody, NoteBody, ProjectBody, RoomBody};
use fieldsync_storage::{
    CheckpointStore, EntityBody, LocalStore, MemoryCheckpointStore, MemoryStore, OperationStatus,
    PendingOperation, SqliteCheckpointStore,
};
use fieldsync_sync::{
    QueueSummary, Resolution, SharedNetworkFlag, SyncConfig, SyncContext, SyncEngine, SyncReport,
};

const STORE_FILE: &str = "store.json";
const SERVER_FILE: &str = "server.json";
const CHECKPOINT_DB: &str = "checkpoints.db";
const CONFIG_FILE: &str = "config.json";

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Offline field-data sync queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (default: platform data dir / fieldsync).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Sync config file (default: config.json in the data directory).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the company whose projects a cycle pulls.
    #[arg(long, global = true)]
    company_id: Option<i64>,

    /// Override the user whose projects a cycle pulls.
    #[arg(long, global = true)]
    user_id: Option<i64>,

    /// Override the per-operation retry limit.
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue counts by status and entity type.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List queued operations.
    List {
        /// Only show operations in this state.
        #[arg(short, long)]
        status: Option<StatusFilter>,
    },

    /// Put every failed operation back in line.
    RetryFailed,

    /// Settle an operation parked on a conflict.
    Resolve {
        /// Operation id as shown by `list`.
        operation_id: String,

        /// Which side wins.
        #[arg(short, long, value_enum)]
        keep: KeepSide,
    },

    /// Run one sync cycle against the simulated server.
    Sync {
        /// Pull this project (server id) instead of running a cycle.
        #[arg(short, long)]
        project: Option<i64>,

        /// Treat the network as unavailable.
        #[arg(long)]
        offline: bool,
    },

    /// Inspect or reset pull checkpoints.
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Run an offline-to-online scenario against a fresh in-memory server.
    Demo {
        /// Write the resulting state to the data directory.
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List stored checkpoints.
    List,
    /// Clear one checkpoint, or all of them.
    Clear {
        /// Checkpoint key.
        key: Option<String>,

        #[arg(long, conflicts_with = "key")]
        all: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    Pending,
    Failed,
    Conflict,
}

impl From<StatusFilter> for OperationStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => OperationStatus::Pending,
            StatusFilter::Failed => OperationStatus::Failed,
            StatusFilter::Conflict => OperationStatus::Conflict,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KeepSide {
    Local,
    Remote,
}

impl From<KeepSide> for Resolution {
    fn from(side: KeepSide) -> Self {
        match side {
            KeepSide::Local => Resolution::KeepLocal,
            KeepSide::Remote => Resolution::KeepRemote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose.
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("fieldsync"),
    };
    let config = load_config(&cli, &data_dir)?;

    match cli.command {
        Commands::Status { json } => cmd_status(&data_dir, &config, json).await,

        Commands::List { status } => cmd_list(&data_dir, &config, status).await,

        Commands::RetryFailed => cmd_retry_failed(&data_dir, &config).await,

        Commands::Resolve { operation_id, keep } => {
            cmd_resolve(&data_dir, &config, &operation_id, keep.into()).await
        }

        Commands::Sync { project, offline } => cmd_sync(&data_dir, &config, project, offline).await,

        Commands::Checkpoints { action } => cmd_checkpoints(&data_dir, action).await,

        Commands::Demo { save } => cmd_demo(&data_dir, config, save).await,
    }
}

fn load_config(cli: &Cli, data_dir: &Path) -> Result<SyncConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE));
    let mut config = if path.exists() {
        SyncConfig::from_file(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
    } else {
        SyncConfig::default()
    };

    if cli.company_id.is_some() {
        config.company_id = cli.company_id;
    }
    if cli.user_id.is_some() {
        config.user_id = cli.user_id;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    Ok(config)
}

/// Local store, simulated server and checkpoints loaded from a data directory.
struct Workspace {
    dir: PathBuf,
    store: Arc<MemoryStore>,
    remote: Arc<MemoryRemote>,
    network: Arc<SharedNetworkFlag>,
    engine: SyncEngine,
}

impl Workspace {
    fn open(dir: &Path, config: &SyncConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        let store = Arc::new(
            MemoryStore::load_from(&dir.join(STORE_FILE)).context("Failed to load local store")?,
        );
        let remote = Arc::new(
            MemoryRemote::load_from(&dir.join(SERVER_FILE)).context("Failed to load server")?,
        );
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(
            SqliteCheckpointStore::open(dir.join(CHECKPOINT_DB))
                .context("Failed to open checkpoint database")?,
        );
        Self::assemble(dir, store, remote, checkpoints, config)
    }

    fn assemble(
        dir: &Path,
        store: Arc<MemoryStore>,
        remote: Arc<MemoryRemote>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let network = Arc::new(SharedNetworkFlag::new(true));
        let ctx = SyncContext::new(
            store.clone(),
            remote.clone(),
            checkpoints,
            network.clone(),
        );
        let engine = SyncEngine::new(ctx, config.clone()).context("Failed to build sync engine")?;
        Ok(Self {
            dir: dir.to_path_buf(),
            store,
            remote,
            network,
            engine,
        })
    }

    fn save(&self) -> Result<()> {
        self.store
            .save_to(&self.dir.join(STORE_FILE))
            .context("Failed to save local store")?;
        self.remote
            .save_to(&self.dir.join(SERVER_FILE))
            .context("Failed to save server")?;
        Ok(())
    }
}

async fn cmd_status(data_dir: &Path, config: &SyncConfig, json: bool) -> Result<()> {
    let ws = Workspace::open(data_dir, config)?;
    let summary = QueueSummary::collect(ws.store.as_ref()).await?;

    if json {
        println!("{}", summary.to_json()?);
        return Ok(());
    }
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &QueueSummary) {
    if summary.total() == 0 {
        println!("Queue is empty.");
    } else {
        println!(
            "Queue: {} pending, {} failed, {} conflict",
            summary.count(OperationStatus::Pending),
            summary.count(OperationStatus::Failed),
            summary.count(OperationStatus::Conflict)
        );
        for (kind, counts) in &summary.by_kind {
            println!(
                "  {:<20} pending={} failed={} conflict={}",
                kind.to_string(),
                counts.pending,
                counts.failed,
                counts.conflict
            );
        }
    }
    if let Some(next) = summary.next_scheduled_at {
        println!("  {} waiting on backoff, next at {}", summary.scheduled, next);
    }
    if summary.open_conflicts > 0 {
        println!("  {} open conflicts", summary.open_conflicts);
    }
}

async fn cmd_list(
    data_dir: &Path,
    config: &SyncConfig,
    status: Option<StatusFilter>,
) -> Result<()> {
    let ws = Workspace::open(data_dir, config)?;
    let wanted = status.map(OperationStatus::from);
    let operations: Vec<PendingOperation> = ws
        .store
        .operations()
        .await?
        .into_iter()
        .filter(|op| wanted.map_or(true, |s| op.status == s))
        .collect();

    if operations.is_empty() {
        println!("No operations.");
        return Ok(());
    }
    for op in &operations {
        print_operation(op);
    }
    Ok(())
}

fn print_operation(op: &PendingOperation) {
    println!(
        "{}  {:<8} {:<20} {:>15}  {:<9} retries={}/{} skips={}/{}",
        op.operation_id,
        op.operation_type.as_str(),
        op.entity_type.to_string(),
        op.entity_id,
        op.status.as_str(),
        op.retry_count,
        op.max_retries,
        op.skip_count,
        op.max_skips
    );
    if let Some(at) = op.scheduled_at {
        println!("    scheduled: {}", at);
    }
    if let Some(error) = &op.error_message {
        println!("    error: {}", error);
    }
}

async fn cmd_retry_failed(data_dir: &Path, config: &SyncConfig) -> Result<()> {
    let ws = Workspace::open(data_dir, config)?;
    let reset = ws.engine.processor().retry_failed_operations().await?;
    ws.save()?;
    println!("Reset {} failed operations.", reset);
    Ok(())
}

async fn cmd_resolve(
    data_dir: &Path,
    config: &SyncConfig,
    operation_id: &str,
    resolution: Resolution,
) -> Result<()> {
    let ws = Workspace::open(data_dir, config)?;
    let result = ws
        .engine
        .processor()
        .resolve_conflict(operation_id, resolution)
        .await
        .with_context(|| format!("Failed to resolve {}", operation_id))?;
    ws.save()?;
    println!("Resolved {} with {}: {:?}", operation_id, resolution, result);
    Ok(())
}

async fn cmd_sync(
    data_dir: &Path,
    config: &SyncConfig,
    project: Option<i64>,
    offline: bool,
) -> Result<()> {
    let ws = Workspace::open(data_dir, config)?;
    ws.network.set_available(!offline);

    let report = match project {
        Some(project_id) => ws.engine.sync_project(project_id, None).await?,
        None => ws.engine.sync_cycle().await?,
    };
    ws.save()?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("{}", report.summary());
    for error in &report.errors {
        println!("  error: {}", error);
    }
    if let Some(next) = report.next_scheduled_at {
        println!("  next retry at {}", next);
    }
}

async fn cmd_checkpoints(data_dir: &Path, action: CheckpointAction) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let store = SqliteCheckpointStore::open(data_dir.join(CHECKPOINT_DB))
        .context("Failed to open checkpoint database")?;

    match action {
        CheckpointAction::List => {
            let entries = store.entries().await?;
            if entries.is_empty() {
                println!("No checkpoints.");
            }
            for (key, value) in entries {
                println!("  {:<40} {}", key, value);
            }
        }
        CheckpointAction::Clear { all: true, .. } => {
            store.clear_all().await?;
            println!("Cleared all checkpoints.");
        }
        CheckpointAction::Clear { key: Some(key), .. } => {
            store.clear(&key).await?;
            println!("Cleared checkpoint {}.", key);
        }
        CheckpointAction::Clear { key: None, .. } => {
            anyhow::bail!("Pass a checkpoint key or --all");
        }
    }
    Ok(())
}

/// Offline edits, reconnect, a concurrent server edit, and its resolution.
async fn cmd_demo(data_dir: &Path, mut config: SyncConfig, save: bool) -> Result<()> {
    let company_id = *config.company_id.get_or_insert(7);
    // No backoff waits, so dependents go out on the next pass.
    config.retry_base_secs = 0;
    config.skip_base_secs = 0;
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let ws = Workspace::assemble(
        data_dir,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryRemote::new()),
        checkpoints.clone(),
        &config,
    )?;
    let engine = &ws.engine;

    info!("Working offline");
    ws.network.set_available(false);
    let project = engine
        .projects()
        .create_project(ProjectBody {
            company_id: Some(company_id),
            title: "Basement flood".to_string(),
            status: "active".to_string(),
            property_id: None,
            assigned_user_ids: config.user_id.into_iter().collect(),
        })
        .await?;
    let location = engine
        .locations()
        .create_location(LocationBody {
            project_id: project.id,
            property_id: None,
            title: "Lower level".to_string(),
            location_type: "floor".to_string(),
            parent_location_id: None,
        })
        .await?;
    let room = engine
        .locations()
        .create_room(RoomBody {
            project_id: project.id,
            location_id: Some(location.id),
            level_id: None,
            title: "Laundry".to_string(),
            room_type: Some("utility".to_string()),
        })
        .await?;
    let note = engine
        .notes()
        .create_note(NoteBody {
            project_id: project.id,
            room_id: Some(room.id),
            content: "Water line at 4 inches".to_string(),
            category_id: None,
        })
        .await?;
    engine
        .equipment()
        .upsert_equipment(
            None,
            EquipmentBody {
                project_id: project.id,
                room_id: Some(room.id),
                equipment_type: "air mover".to_string(),
                quantity: 3,
                status: "placed".to_string(),
            },
        )
        .await?;

    println!("== Offline queue");
    print_summary(&QueueSummary::collect(ws.store.as_ref()).await?);

    info!("Back online");
    ws.network.set_available(true);
    let mut report = engine.on_network_restored().await?;
    // Children that waited on parent ids go out on the following passes.
    for _ in 0..3 {
        if ws.store.operations().await?.is_empty() {
            break;
        }
        report = engine.on_network_restored().await?;
    }
    println!("== After reconnect");
    print_report(&report);
    print_summary(&QueueSummary::collect(ws.store.as_ref()).await?);

    let note = ws
        .store
        .get(EntityKind::Note, note.id)
        .await?
        .context("Demo note disappeared")?;
    let note_server_id = note.server_id.context("Demo note was not pushed")?;
    ws.remote.edit(EntityKind::Note, note_server_id, |body| {
        if let EntityBody::Note(n) = body {
            n.content = "Water line at 6 inches (office edit)".to_string();
        }
    });
    if let EntityBody::Note(mut body) = note.body.clone() {
        body.content = "Water line at 5 inches".to_string();
        engine.notes().update_note(note.id, body).await?;
    }
    let report = engine.sync_cycle().await?;
    println!("== After concurrent edit");
    print_report(&report);

    for conflict in ws.store.open_conflicts().await? {
        println!(
            "Conflict on {} {}: keeping local edit",
            conflict.entity_type, conflict.entity_id
        );
        engine
            .processor()
            .resolve_conflict(&conflict.operation_id, Resolution::KeepLocal)
            .await?;
    }
    let report = engine.sync_cycle().await?;
    println!("== After resolution");
    print_report(&report);

    if let Some(server_project) = ws
        .store
        .get(EntityKind::Project, project.id)
        .await?
        .and_then(|p| p.server_id)
    {
        let report = engine.sync_project(server_project, None).await?;
        println!("== Project {} pulled", server_project);
        print_report(&report);
    }
    print_summary(&QueueSummary::collect(ws.store.as_ref()).await?);

    if save {
        std::fs::create_dir_all(data_dir)?;
        ws.save()?;
        let persisted = SqliteCheckpointStore::open(data_dir.join(CHECKPOINT_DB))
            .context("Failed to open checkpoint database")?;
        persisted.clear_all().await?;
        for (key, value) in checkpoints.entries().await? {
            persisted.set(&key, value).await?;
        }
        println!("Saved demo state to {}", data_dir.display());
    }
    Ok(())
}
