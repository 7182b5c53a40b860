use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pubsync_core::RelationshipKind;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pubsync")]
#[command(about = "Publisher snapshot sync and ads.txt materialization")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and exit.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Regenerate ads.txt lines for specific connections of one kind.
    Adstxt {
        /// direct, child or seat-owner
        #[arg(long)]
        kind: RelationshipKind,
        /// Comma-separated connection ids.
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<i64>,
    },
    /// Run sync cycles on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let json = std::env::var("PUBSYNC_LOG_JSON").is_ok_and(|v| matches!(v.as_str(), "1" | "true"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!(err)).context("installing tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;
    tracing::debug!(command = ?cli.command, "pubsync starting");

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = pubsync_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} listed={} selected={} succeeded={} failed={} publishers={}",
                summary.run_id,
                summary.listed_objects,
                summary.selected_objects,
                summary.succeeded_objects,
                summary.failed_objects,
                summary.publishers_upserted
            );
            if let Some(adstxt) = summary.adstxt {
                println!(
                    "ads.txt: candidates={} batches={} inserted={} metadata_records={}",
                    adstxt.candidates, adstxt.batches, adstxt.lines_inserted, adstxt.metadata_records
                );
            }
        }
        Commands::Migrate => {
            pubsync_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Adstxt { kind, ids } => {
            let summary = pubsync_sync::regenerate_from_env(kind, &ids).await?;
            println!(
                "ads.txt {kind}: connections={} candidates={} batches={} inserted={} metadata_records={}",
                ids.len(),
                summary.candidates,
                summary.batches,
                summary.lines_inserted,
                summary.metadata_records
            );
        }
        Commands::Schedule => {
            pubsync_sync::run_scheduler_from_env().await?;
        }
    }

    Ok(())
}
