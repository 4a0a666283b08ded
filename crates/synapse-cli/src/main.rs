#![forbid(unsafe_code)]

//! **synapse-cli** – Administrative command line for a Synapse deployment.
//!
//! Operators use this binary against the shared event database: create the
//! schema, publish ad-hoc events, inspect and retry the dead-letter queue,
//! and replay historical events as JSON lines.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use synapse_runtime::Settings;
use synapse_store_core::EventStore;
use synapse_store_postgres::PostgresEventStore;
use synapse_types::registry::EventTypeRegistry;
use synapse_types::Event;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "synapse")]
#[command(about = "Synapse event dispatch core - admin tooling")]
#[command(version)]
struct Cli {
    /// Database URL; falls back to SYNAPSE_DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the events schema
    Migrate,
    /// Publish an event built from a JSON payload
    Publish {
        /// Event kind discriminator, e.g. ws.message
        #[arg(long)]
        kind: String,
        /// Producer label, e.g. cli:operator
        #[arg(long, default_value = "cli")]
        source: String,
        /// Variant payload as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Dead-letter queue management
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Replay events in a time range as JSON lines
    Replay {
        /// Start of the range (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,
        /// End of the range (RFC 3339); defaults to now
        #[arg(long)]
        end: Option<DateTime<Utc>>,
        /// Restrict to these event kinds (repeatable)
        #[arg(long = "kind")]
        kinds: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead-lettered events, most recent first
    List {
        /// Maximum rows to show
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Move one dead-lettered event back to pending
    Retry {
        /// Id of the event to retry
        event_id: String,
    },
    /// Move every dead-lettered event back to pending
    RetryAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let settings = Settings::from_env()?;
    let database_url = cli
        .database_url
        .clone()
        .unwrap_or_else(|| settings.database_url.clone());

    let registry = Arc::new(EventTypeRegistry::with_builtins());
    let store = PostgresEventStore::connect(&database_url, registry.clone())
        .await?
        .with_policy(settings.retry);

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            info!("events schema is up to date");
        }
        Commands::Publish {
            kind,
            source,
            payload,
        } => {
            let event = build_event(&registry, &kind, &source, &payload)?;
            store.publish(&event).await?;
            println!("{}", event.id);
        }
        Commands::Dlq { command } => match command {
            DlqCommands::List { limit } => {
                let entries = store.dlq_list(limit).await?;
                for entry in &entries {
                    let line = serde_json::json!({
                        "id": entry.id,
                        "type": entry.kind,
                        "source": entry.source,
                        "attempts": entry.attempts,
                        "error": entry.error,
                        "created_at": entry.created_at,
                    });
                    println!("{line}");
                }
                info!(count = entries.len(), "dead-lettered events listed");
            }
            DlqCommands::Retry { event_id } => {
                if store.dlq_retry(&event_id).await? {
                    println!("event {event_id} moved back to pending");
                } else {
                    anyhow::bail!("event {event_id} is not in the dead-letter queue");
                }
            }
            DlqCommands::RetryAll => {
                let moved = store.dlq_retry_all().await?;
                println!("{moved} events moved back to pending");
            }
        },
        Commands::Replay { start, end, kinds } => {
            let events = store.replay(start, end, &kinds).await?;
            for event in &events {
                println!("{}", event.to_json()?);
            }
            info!(count = events.len(), "replay completed");
        }
    }

    store.close().await;
    Ok(())
}

/// Assemble and validate an event from CLI arguments.
fn build_event(
    registry: &EventTypeRegistry,
    kind: &str,
    source: &str,
    payload: &str,
) -> Result<Event> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("payload must be valid JSON")?;
    let serde_json::Value::Object(mut fields) = payload else {
        anyhow::bail!("payload must be a JSON object");
    };

    fields.insert("id".into(), serde_json::json!(Uuid::new_v4().to_string()));
    fields.insert("type".into(), serde_json::json!(kind));
    fields.insert("source".into(), serde_json::json!(source));
    fields.insert("timestamp".into(), serde_json::json!(Utc::now()));

    let raw = serde_json::to_string(&fields)?;
    // Validation against the registered variant happens in parse().
    Ok(registry.parse(&raw)?)
}
