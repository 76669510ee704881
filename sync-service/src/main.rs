use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sync_service::db::{MemoryStore, PgStore, Store};
use sync_service::{ApiClient, ImageImporter, RateLimiter, SyncConfig, SyncScheduler, Synchronizer};

#[derive(Parser)]
#[command(name = "churchsync")]
#[command(about = "Mirror calendars, events and service assignments into a local database")]
#[command(
    long_about = "Pulls calendars, appointments, events and service assignments from a church \
    management platform and keeps a local Postgres copy up to date.\n\n\
    Settings come from churchsync.toml (or --config) and CHURCHSYNC_* environment variables."
)]
struct Cli {
    /// TOML configuration file. Defaults to ./churchsync.toml when present.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl+C
    ///
    /// Syncs once on startup, then on the configured interval, and keeps
    /// the login session alive in between.
    Run,

    /// Run a single sync now
    Sync {
        /// Rewrite every fetched event even if its timestamp has not advanced
        #[arg(short, long)]
        force: bool,

        /// Sync into an in-memory store and report what would change.
        /// Images are not downloaded.
        #[arg(long)]
        dry_run: bool,
    },

    /// Check the credentials against the remote platform
    Login,

    /// Show the last sync run and the number of stored events
    Status {
        /// Also list this many recent runs
        #[arg(short = 'n', long, default_value_t = 0)]
        history: i64,
    },

    /// Refresh and list calendars, optionally changing which are synced
    Calendars {
        /// Remote calendar id to include in syncs (repeatable)
        #[arg(long, value_name = "ID")]
        select: Vec<i64>,

        /// Remote calendar id to exclude from syncs (repeatable)
        #[arg(long, value_name = "ID")]
        deselect: Vec<i64>,

        /// List what is stored without contacting the remote platform
        #[arg(long)]
        offline: bool,
    },

    /// Apply pending database migrations
    Migrate {
        /// List pending migrations without applying them
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "churchsync=info,sync_service=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => run_scheduler(config).await?,
        Commands::Sync { force, dry_run } => sync_once(config, force, dry_run).await?,
        Commands::Login => login(config).await?,
        Commands::Status { history } => status(config, history).await?,
        Commands::Calendars {
            select,
            deselect,
            offline,
        } => calendars(config, select, deselect, offline).await?,
        Commands::Migrate { check: false } => {
            open_store(&config).await?;
        }
        Commands::Migrate { check: true } => pending_migrations(&config).await?,
    }

    Ok(())
}

/// Connect to Postgres and bring the schema up to date
async fn open_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url, config.database_tls)?;

    let applied = store
        .migrate()
        .await
        .context("Failed to apply database migrations")?;
    if applied.is_empty() {
        tracing::info!("Database schema is up to date");
    } else {
        tracing::info!("Applied {} migration(s): {}", applied.len(), applied.join(", "));
    }

    Ok(Arc::new(store))
}

async fn pending_migrations(config: &SyncConfig) -> Result<()> {
    let store = PgStore::connect(&config.database_url, config.database_tls)?;
    let pending = store.pending_migrations().await?;
    if pending.is_empty() {
        println!("No pending migrations.");
    }
    for name in pending {
        println!("pending {}", name);
    }
    Ok(())
}

fn api_client(config: &SyncConfig) -> Result<Arc<ApiClient>> {
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    if limiter.is_bypassed() {
        tracing::warn!("API rate limiting is disabled");
    }
    let client = ApiClient::from_config(config, limiter).context("Failed to set up API client")?;
    tracing::debug!(limit_key = client.limit_key(), "API client ready");
    Ok(Arc::new(client))
}

fn synchronizer(
    config: &SyncConfig,
    api: &Arc<ApiClient>,
    store: Arc<dyn Store>,
    with_images: bool,
) -> Synchronizer {
    let images = with_images.then(|| {
        Arc::new(ImageImporter::new(
            api.http().clone(),
            config.media_dir.clone(),
            store.clone(),
        ))
    });
    Synchronizer::new(api.clone(), store, images, config.sync.clone())
        .with_installation_id(config.installation_id.clone())
}

async fn run_scheduler(config: SyncConfig) -> Result<()> {
    tracing::info!(
        installation = %config.installation_id,
        "Starting churchsync against {}",
        config.base_url()
    );

    let store = open_store(&config).await?;
    let api = api_client(&config)?;
    let synchronizer = Arc::new(synchronizer(&config, &api, store, true));

    // The manual trigger channel stays open as long as `_trigger` lives
    let (scheduler, _trigger) = SyncScheduler::new(
        synchronizer,
        Some(api.auth().clone()),
        config.sync.interval(),
    );

    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.run().await {
            tracing::error!("Scheduler error: {:?}", e);
        }
    });

    tracing::info!("churchsync running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping...");

    scheduler_handle.abort();

    tracing::info!("churchsync stopped");
    Ok(())
}

async fn sync_once(config: SyncConfig, force: bool, dry_run: bool) -> Result<()> {
    let api = api_client(&config)?;
    let store: Arc<dyn Store> = if dry_run {
        Arc::new(MemoryStore::new())
    } else {
        open_store(&config).await?
    };

    let synchronizer = synchronizer(&config, &api, store, !dry_run);
    if dry_run && config.sync.selected_calendar_ids.is_empty() {
        println!("Dry run without sync.selected_calendar_ids: only catalogues are fetched.");
    }

    let summary = synchronizer
        .trigger(shared::SyncRequest::manual(force))
        .await;

    if !summary.success {
        bail!("Sync failed: {}", summary.message);
    }

    if dry_run {
        println!("Dry run, nothing was written.");
    }
    println!("{}", summary.message);
    Ok(())
}

async fn login(config: SyncConfig) -> Result<()> {
    let api = api_client(&config)?;

    let outcome = api.auth().login().await;
    if !outcome.success {
        bail!("{}", outcome.message);
    }
    println!("{}", outcome.message);

    let user = api
        .whoami()
        .await
        .context("Logged in, but the API did not answer")?;
    if let Some(name) = user.display_name() {
        println!("Connected as {}", name);
    }
    Ok(())
}

async fn status(config: SyncConfig, history: i64) -> Result<()> {
    let store = open_store(&config).await?;

    match store.latest_sync().await? {
        Some(last) => {
            let last = shared::LastSyncStatus::from(&last);
            println!(
                "Last sync: {} ({}) started {}",
                last.status.as_str(),
                last.sync_type.as_str(),
                last.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if let Some(completed) = last.completed_at {
                println!("    Completed {}", completed.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if let Some(message) = &last.message {
                println!("    {}", message);
            }
            println!(
                "    {} found, {} inserted, {} updated, {} skipped",
                last.stats.events_found,
                last.stats.events_inserted,
                last.stats.events_updated,
                last.stats.events_skipped
            );
        }
        None => println!("No sync has run yet."),
    }

    println!("Stored events: {}", store.count_events().await?);

    if history > 0 {
        println!();
        for run in store.list_sync_history(history).await? {
            println!(
                "{} {:<9} {:<7} {} written",
                run.started_at.format("%Y-%m-%d %H:%M"),
                run.sync_type.as_str(),
                run.status.as_str(),
                run.stats.events_written()
            );
        }
    }
    Ok(())
}

async fn calendars(
    config: SyncConfig,
    select: Vec<i64>,
    deselect: Vec<i64>,
    offline: bool,
) -> Result<()> {
    let store = open_store(&config).await?;

    if !offline {
        let api = api_client(&config)?;
        synchronizer(&config, &api, store.clone(), true)
            .sync_calendars()
            .await
            .context("Failed to refresh calendars")?;
    }

    for id in select {
        store.set_calendar_selected(id, true).await?;
    }
    for id in deselect {
        store.set_calendar_selected(id, false).await?;
    }

    let calendars = store.list_calendars().await?;
    if calendars.is_empty() {
        println!("No calendars found.");
    }
    for calendar in calendars {
        let marker = if calendar.is_selected { "✓" } else { "○" };
        println!("{} [{}] {}", marker, calendar.remote_id, calendar.name);
    }
    Ok(())
}
