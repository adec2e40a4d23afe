use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use boxtask_core::config::format_duration;
use boxtask_core::store::{CURRENT_TASK_KEY, StoredHandle};
use boxtask_core::{PollingConfig, SqliteStateStore, TaskKind};
use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "boxtask")]
#[command(about = "Inspect recorded device tasks and polling settings", long_about = None)]
struct Cli {
    /// Directory holding state.db
    #[arg(short, long, default_value = "/var/lib/boxtask")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recorded task handles
    Handles {
        #[command(subcommand)]
        action: HandleAction,
    },

    /// Effective polling configuration
    Polling {
        #[command(subcommand)]
        action: PollingAction,
    },
}

#[derive(Subcommand)]
enum HandleAction {
    /// List every instance with a recorded task
    List,

    /// Show the task recorded for one instance
    Show {
        /// Instance ID
        instance: String,
    },

    /// Forget the task recorded for one instance. The remote task is left
    /// untouched and must be cleaned up on the device.
    Forget {
        /// Instance ID
        instance: String,
    },
}

#[derive(Subcommand)]
enum PollingAction {
    /// Print intervals and timeouts per operation category
    Show {
        /// JSON file with overrides
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct HandleRow {
    #[tabled(rename = "INSTANCE")]
    instance: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "TASK ID")]
    id: String,
    #[tabled(rename = "UPDATED")]
    updated_at: String,
}

#[derive(Tabled)]
struct PollingRow {
    #[tabled(rename = "CATEGORY")]
    category: &'static str,
    #[tabled(rename = "INTERVAL")]
    interval: String,
    #[tabled(rename = "TIMEOUT")]
    timeout: String,
}

fn describe_kind(kind: &str) -> String {
    match kind.parse::<TaskKind>() {
        Ok(kind) => kind.to_string(),
        Err(_) => format!("{} (unknown)", kind),
    }
}

fn handle_row(instance: String, value: &[u8], updated_at: String) -> HandleRow {
    let (kind, id) = match StoredHandle::decode(value) {
        Ok(Some(stored)) => (describe_kind(&stored.kind), stored.id.to_string()),
        Ok(None) => ("-".to_string(), "-".to_string()),
        Err(e) => {
            warn!(instance = %instance, "{}", e);
            ("corrupt".to_string(), "-".to_string())
        }
    };
    HandleRow {
        instance,
        kind,
        id,
        updated_at,
    }
}

async fn open_store(state_dir: &Path) -> Result<SqliteStateStore> {
    if !state_dir.is_dir() {
        bail!("state directory {} does not exist", state_dir.display());
    }
    SqliteStateStore::new(state_dir)
        .await
        .with_context(|| format!("opening state in {}", state_dir.display()))
}

async fn handles(state_dir: &Path, action: HandleAction) -> Result<()> {
    let store = open_store(state_dir).await?;

    match action {
        HandleAction::List => {
            let entries = store.list(CURRENT_TASK_KEY).await?;
            if entries.is_empty() {
                println!("No recorded tasks");
                return Ok(());
            }
            let rows: Vec<HandleRow> = entries
                .into_iter()
                .map(|e| handle_row(e.instance_id, &e.value, e.updated_at))
                .collect();
            println!("{}", Table::new(rows));
        }
        HandleAction::Show { instance } => {
            let entry = store
                .list(CURRENT_TASK_KEY)
                .await?
                .into_iter()
                .find(|e| e.instance_id == instance);
            match entry {
                Some(e) => {
                    let raw = String::from_utf8_lossy(&e.value).into_owned();
                    let row = handle_row(e.instance_id, &e.value, e.updated_at);
                    println!("Instance: {}", row.instance);
                    println!("Kind:     {}", row.kind);
                    println!("Task ID:  {}", row.id);
                    println!("Updated:  {}", row.updated_at);
                    println!("Raw:      {}", raw);
                }
                None => println!("No task recorded for {}", instance),
            }
        }
        HandleAction::Forget { instance } => {
            if store.forget(&instance, CURRENT_TASK_KEY).await? {
                info!(instance = %instance, "Forgot recorded task");
                println!("Forgot task recorded for {}", instance);
            } else {
                println!("No task recorded for {}", instance);
            }
        }
    }

    Ok(())
}

async fn polling(action: PollingAction) -> Result<()> {
    match action {
        PollingAction::Show { config } => {
            let cfg = match &config {
                Some(path) => PollingConfig::from_file(path)
                    .await
                    .with_context(|| format!("loading {}", path.display()))?,
                None => PollingConfig::default(),
            };

            let rows: Vec<PollingRow> = cfg
                .categories()
                .into_iter()
                .map(|(category, spec)| PollingRow {
                    category,
                    interval: format_duration(spec.interval),
                    timeout: format_duration(spec.timeout),
                })
                .collect();
            println!("{}", Table::new(rows));
            println!(
                "Upload completion: {}",
                serde_json::to_string(&cfg.upload_completion)?.trim_matches('"')
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boxtask=info,boxtask_core=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Handles { action } => handles(&cli.state_dir, action).await,
        Commands::Polling { action } => polling(action).await,
    }
}
