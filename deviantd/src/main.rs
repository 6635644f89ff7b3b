use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use deviant_core::OAuthClient;
use deviantd::config::{AppConfig, Overrides};
use deviantd::job::{JobRunner, JobSnapshot};
use deviantd::sync::engine::SyncEngine;
use deviantd::sync::legacy::migrate_legacy_state;
use deviantd::sync::library::Library;
use deviantd::sync::reconcile::reconcile;
use deviantd::sync::store::MetadataStore;
use deviantd::sync::transfer::TransferClient;
use deviantd::token_provider::TokenProvider;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "deviantd", version, about = "Watches DeviantArt galleries and downloads new uploads")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Import legacy state, reconcile, then sync once or every N seconds.
    Run {
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Bring the metadata store in line with the download directory.
    Reconcile,
    /// Print the gallery listing as JSON.
    Gallery {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        favorites_only: bool,
    },
    Favorite {
        path: String,
        #[arg(long)]
        unset: bool,
    },
    Delete {
        path: String,
    },
    DeleteArtist {
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    config.apply(&cli.overrides);
    init_tracing(config.verbose);

    let store = MetadataStore::open(&config.db_file)
        .await
        .with_context(|| format!("failed to open metadata store at {:?}", config.db_file))?;

    match cli.command {
        Command::Run { interval } => {
            if let Some(secs) = interval {
                config.poll_interval = Duration::from_secs(secs);
            }
            run(config, store).await
        }
        Command::Reconcile => {
            let stats = reconcile(&store, &config.output_dir)
                .await
                .context("reconcile failed")?;
            print_json(&stats)
        }
        Command::Gallery {
            search,
            favorites_only,
        } => {
            let library = Library::new(store, config.output_dir);
            let listing = library.query(search.as_deref(), favorites_only).await?;
            print_json(&listing)
        }
        Command::Favorite { path, unset } => {
            let library = Library::new(store, config.output_dir);
            let record = library.set_favorite(&path, !unset).await?;
            print_json(&record)
        }
        Command::Delete { path } => {
            let library = Library::new(store, config.output_dir);
            let summary = library.delete_image(&path).await?;
            print_json(&summary)
        }
        Command::DeleteArtist { name } => {
            let library = Library::new(store, config.output_dir);
            let summary = library.delete_artist(&name).await?;
            print_json(&summary)
        }
    }
}

async fn run(config: AppConfig, store: MetadataStore) -> anyhow::Result<()> {
    let (client_id, client_secret) = config.validate_for_sync()?;

    if let Some(stats) = migrate_legacy_state(&store, &config.state_file)
        .await
        .context("legacy state import failed")?
    {
        info!(artists = stats.artists, seen = stats.seen_rows, "imported legacy state");
    }
    let reconciled = reconcile(&store, &config.output_dir)
        .await
        .context("startup reconcile failed")?;
    info!(
        scanned = reconciled.scanned,
        added = reconciled.added,
        removed = reconciled.removed,
        "reconciled download directory"
    );

    let http = TransferClient::build_http(&config.user_agent, config.request_timeout)
        .context("failed to build http client")?;
    let oauth = OAuthClient::new(client_id, client_secret)?.with_http(http.clone());
    let engine = SyncEngine::new(TokenProvider::new(oauth), store, config.output_dir.clone())
        .with_http(http.clone())
        .with_transfer(TransferClient::with_http(http));
    let runner = JobRunner::new(Arc::new(engine));
    let run_config = config.run_config();

    info!(
        artists = config.artists.len(),
        pages = config.pages_per_check,
        interval_secs = config.poll_interval.as_secs(),
        "watcher started"
    );
    let interrupted = CancellationToken::new();
    {
        let runner = runner.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, stopping");
                interrupted.cancel();
                runner.cancel();
            }
        });
    }

    loop {
        runner.start(&run_config)?;
        let snapshot = runner.wait().await;
        report(&snapshot);
        if interrupted.is_cancelled() {
            return Ok(());
        }

        if config.poll_interval.is_zero() {
            return match snapshot.result {
                Some(result) if result.ok => Ok(()),
                _ => anyhow::bail!("sync run failed: {}", snapshot.message),
            };
        }
        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = interrupted.cancelled() => return Ok(()),
        }
    }
}

fn report(snapshot: &JobSnapshot) {
    let Some(result) = &snapshot.result else {
        warn!(job_id = snapshot.job_id, message = %snapshot.message, "sync run failed");
        return;
    };
    info!(
        job_id = snapshot.job_id,
        outcome = ?result.outcome,
        artists = result.stats.artists_checked,
        pages = result.stats.pages_checked,
        new = result.stats.new_items,
        downloaded = result.stats.downloaded,
        existing = result.stats.existing,
        skipped = result.stats.skipped,
        errors = result.stats.errors,
        "sync run finished"
    );
    for error in &result.errors {
        warn!("{error}");
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "deviantd=debug" } else { "deviantd=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let output = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{output}");
    Ok(())
}
