/*
hubcast - single-binary main.rs
Runs the broadcast scheduler and the Telegram command bot in one process.
*/

use anyhow::{Context, Result};
use clap::Parser;
use common::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use hubcast::bot::Bot;
use hubcast::commands::CommandService;
use hubcast::delivery::TelegramDispatcher;
use hubcast::engine::{CycleOutcome, EngineSettings, IngestionEngine};
use hubcast::hubs::HubCatalog;
use hubcast::ingestion::HabrFetcher;
use hubcast::scheduler::{parse_slot_time, Schedule, Scheduler};
use hubcast::storage::{
    DeliveryLedger, MemoryLedger, MemorySubscriptionStore, SqliteLedger, SqliteSubscriptionStore,
    SubscriptionStore,
};
use hubcast::telegram::TelegramClient;

#[derive(Parser, Debug)]
#[command(name = "hubcast", about = "Habr hub digest: scheduled broadcasts + Telegram bot")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Do not poll Telegram for commands (scheduled broadcasts only)
    #[arg(long)]
    no_bot: bool,

    /// Run the slot at HH:MM once, right now, then exit
    #[arg(long, value_name = "HH:MM")]
    run_once: Option<String>,

    /// Keep the ledger and subscribers in memory instead of SQLite
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Secrets (bot token) may come from a local .env file
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let catalog = Arc::new(HubCatalog::from_config(&config.hubs)?);
    let schedule = Schedule::from_config(&config.scheduler)?;
    info!(hubs = catalog.len(), timezone = schedule.timezone().name(), "catalog and schedule ready");

    let (ledger, subscriptions) = open_stores(&config, args.ephemeral, catalog.clone()).await?;

    let fetcher_cfg = config.fetcher();
    let fetcher = Arc::new(HabrFetcher::from_config(&fetcher_cfg)?);

    let telegram = telegram_client(&config)?;
    let send_interval = Duration::from_millis(
        config.telegram.as_ref().and_then(|t| t.send_interval_ms).unwrap_or(50),
    );
    let dispatcher = Arc::new(TelegramDispatcher::new(telegram.clone(), catalog.clone(), send_interval));

    let engine = Arc::new(
        IngestionEngine::new(catalog.clone(), fetcher, dispatcher, ledger, subscriptions).with_settings(
            EngineSettings {
                hub_timeout: Duration::from_secs(fetcher_cfg.hub_timeout_seconds.unwrap_or(30)),
                ..EngineSettings::default()
            },
        ),
    );

    if let Some(time) = args.run_once {
        let time = parse_slot_time(&time)?;
        let scheduler = Scheduler::new(engine.clone(), schedule, Arc::new(Notify::new()));
        match scheduler.run_slot_now(time).await? {
            CycleOutcome::Completed(summary) => info!(
                planned = summary.planned,
                accepted = summary.report.accepted,
                rejected = summary.report.rejected,
                failed_hubs = summary.failed_hubs.len(),
                "one-off cycle finished"
            ),
            CycleOutcome::Skipped => warn!("one-off cycle skipped"),
        }
        return Ok(());
    }

    // One notifier per task: notify_one stores a permit, so a task that is busy when
    // ctrl-c arrives still sees it on its next wait.
    let scheduler_shutdown = Arc::new(Notify::new());
    let bot_shutdown = Arc::new(Notify::new());

    let scheduler = Scheduler::new(engine.clone(), schedule.clone(), scheduler_shutdown.clone());
    let scheduler_handle = tokio::spawn(scheduler.run());

    let bot_handle = if args.no_bot {
        info!("Telegram command bot disabled via CLI (--no-bot)");
        None
    } else {
        let mut commands = CommandService::new(engine.clone());
        if let Some(limits) = &config.limits {
            commands = commands.with_limits(limits);
        }
        let poll_timeout = Duration::from_secs(
            config.telegram.as_ref().and_then(|t| t.poll_timeout_seconds).unwrap_or(30),
        );
        let bot = Bot::new(telegram, Arc::new(commands), &schedule, bot_shutdown.clone())
            .with_poll_timeout(poll_timeout);
        Some(tokio::spawn(bot.run()))
    };

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    scheduler_shutdown.notify_one();
    bot_shutdown.notify_one();

    let handles = std::iter::once(("scheduler", scheduler_handle)).chain(bot_handle.map(|h| ("bot", h)));
    for (name, handle) in handles {
        match tokio::time::timeout(Duration::from_secs(20), handle).await {
            Ok(Ok(())) => info!(task = name, "task exited cleanly"),
            Ok(Err(join_err)) => error!(task = name, %join_err, "task panicked"),
            Err(_) => warn!(task = name, "timed out waiting for task to exit; continuing shutdown"),
        }
    }

    if engine.is_cycle_running() {
        warn!("a scheduled cycle was still running at shutdown; undelivered articles are retried next run");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn open_stores(
    config: &Config,
    ephemeral: bool,
    catalog: Arc<HubCatalog>,
) -> Result<(Arc<dyn DeliveryLedger>, Arc<dyn SubscriptionStore>)> {
    if ephemeral {
        warn!("ephemeral mode: ledger and subscribers are lost on exit");
        return Ok((
            Arc::new(MemoryLedger::new()),
            Arc::new(MemorySubscriptionStore::new(catalog)),
        ));
    }

    // Resolve and log the absolute DB path before connecting
    let db_path_abs = match tokio::fs::canonicalize(&config.database.path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => config.database.path.clone(),
    };
    info!(db_path = %db_path_abs, "resolved DB path");

    let pool = common::init_db_pool(&db_path_abs).await.map_err(|e| {
        error!(%e, db_path = %db_path_abs, "failed to initialize database pool");
        e
    })?;
    common::run_migrations(&pool).await?;
    info!("DB migrations completed");

    Ok((
        Arc::new(SqliteLedger::new(pool.clone())),
        Arc::new(SqliteSubscriptionStore::new(pool, catalog)),
    ))
}

fn telegram_client(config: &Config) -> Result<Arc<TelegramClient>> {
    let cfg = config.telegram.as_ref();
    let token_env = cfg
        .and_then(|t| t.token_env.as_deref())
        .unwrap_or("TELEGRAM_BOT_TOKEN");
    let token = std::env::var(token_env)
        .with_context(|| format!("Telegram bot token env var '{}' not set", token_env))?;
    let api_url = cfg
        .and_then(|t| t.api_url.as_deref())
        .unwrap_or("https://api.telegram.org");
    let timeout = Duration::from_secs(cfg.and_then(|t| t.request_timeout_seconds).unwrap_or(10));

    let client = TelegramClient::new(api_url, &token, timeout).context("failed to build Telegram client")?;
    Ok(Arc::new(client))
}
