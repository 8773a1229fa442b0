use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tenacious_core::impls::SqliteEntryStore;
use tenacious_core::{DurableQueue, PayloadHandler, QueueConfig, QueueCore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tenacious")]
#[command(about = "Durable retry queue backed by SQLite", version)]
struct Cli {
    /// SQLite database holding the persisted entries.
    #[arg(long, env = "TENACIOUS_DATABASE", default_value = "tenacious.db")]
    database: PathBuf,

    /// Owner partition of the database this process works on.
    #[arg(long, env = "TENACIOUS_OWNER", default_value = "default")]
    owner: String,

    /// TOML file with the queue settings (name, concurrency, retry_period_ms).
    #[arg(long, env = "TENACIOUS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Persist a request. Without a payload an aged-message payload is generated.
    Push { id: String, payload: Option<String> },
    /// Cancel a request and delete its entry.
    Remove { id: String },
    /// Print the owner's persisted entries, oldest first.
    List,
    /// Process the owner's entries until Ctrl-C.
    Run {
        /// A payload succeeds once it is older than this.
        #[arg(long, default_value_t = 10)]
        max_age_secs: i64,
    },
}

/// Payload understood by the `run` handler.
#[derive(Debug, Serialize, Deserialize)]
struct AgedPayload {
    created_at: DateTime<Utc>,
    #[serde(default)]
    message: String,
}

/// Succeeds once a payload has aged past `max_age`, so fresh items cycle
/// through a few retries first.
struct MaxAgeHandler {
    max_age: Duration,
}

#[async_trait]
impl PayloadHandler for MaxAgeHandler {
    async fn handle(&self, payload: &str) -> bool {
        let aged: AgedPayload = match serde_json::from_str(payload) {
            Ok(aged) => aged,
            Err(err) => {
                // retrying cannot fix a payload we cannot read
                warn!(error = %err, payload, "discarding malformed payload");
                return true;
            }
        };

        let age = Utc::now() - aged.created_at;
        if age < self.max_age {
            info!(
                message = %aged.message,
                age_secs = age.num_seconds(),
                "too young, retrying later"
            );
            return false;
        }

        info!(message = %aged.message, age_secs = age.num_seconds(), "processed");
        true
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_config(path: Option<&PathBuf>) -> Result<QueueConfig> {
    let Some(path) = path else {
        return Ok(QueueConfig::new("tenacious"));
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    QueueConfig::from_toml_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn max_age(secs: i64) -> Result<Duration> {
    if secs < 0 {
        return Err(anyhow!("--max-age-secs must not be negative, got {secs}"));
    }
    Duration::try_seconds(secs).ok_or_else(|| anyhow!("--max-age-secs {secs} is out of range"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = load_config(cli.config.as_ref())?;
    let core = Arc::new(QueueCore::new(config).context("invalid queue configuration")?);
    let store = Arc::new(
        SqliteEntryStore::open(&cli.database)
            .with_context(|| format!("opening database {}", cli.database.display()))?,
    );
    let queue = DurableQueue::open(store, core, cli.owner.as_str())
        .await
        .context("opening queue")?;

    match cli.command {
        Command::Push { id, payload } => {
            let payload = match payload {
                Some(payload) => payload,
                None => serde_json::to_string(&AgedPayload {
                    created_at: Utc::now(),
                    message: id.clone(),
                })?,
            };
            queue.push(&id, &payload).await?;
            println!("pushed {id}");
        }
        Command::Remove { id } => {
            queue.remove(&id).await?;
            println!("removed {id}");
        }
        Command::List => {
            for entry in queue.list().await? {
                println!(
                    "{}\t{}\t{}",
                    entry.external_id,
                    entry.creation_time.to_rfc3339(),
                    entry.payload
                );
            }
        }
        Command::Run { max_age_secs } => {
            let handler = MaxAgeHandler {
                max_age: max_age(max_age_secs)?,
            };
            let handle = queue.run(Arc::new(handler))?;
            info!(owner = %queue.owner(), "running, press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;

            info!(counts = ?queue.core().counts().await, "shutting down");
            handle.shutdown_and_join().await;
        }
    }

    Ok(())
}
