/*!
common/src/lib.rs

Shared configuration types and DB helper functions for hubcast.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default and an override config file
- Helpers to open an SQLite pool and run the bundled migrations
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use url::Url;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/hubcast.db")
    pub path: String,
}

/// One daily broadcast slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Wall-clock time in "HH:MM" 24h format, interpreted in `SchedulerConfig::timezone`
    pub time: String,
    /// How far back (in hours) the slot looks for new articles
    pub lookback_hours: u32,
}

/// Scheduler (broadcast times) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone name, e.g. "Europe/Moscow"
    pub timezone: Option<String>,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
}

/// Politeness / fetching configuration for the content site
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    /// Timeout of a single HTTP request
    pub request_timeout_seconds: Option<u64>,
    /// Upper bound for fetching every page of one hub, not counting time queued behind
    /// other hubs' requests
    pub hub_timeout_seconds: Option<u64>,
    /// Minimum spacing between two requests to the site, shared by all hubs
    pub request_interval_ms: Option<u64>,
    pub max_pages: Option<u32>,
    pub max_retries: Option<u32>,
}

impl FetcherConfig {
    /// Parsed `base_url`, falling back to the public Habr site.
    pub fn base_url(&self) -> Result<Url> {
        let raw = self.base_url.as_deref().unwrap_or("https://habr.com");
        Url::parse(raw).with_context(|| format!("invalid fetcher.base_url: {}", raw))
    }
}

/// Telegram Bot API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Name of the environment variable holding the bot token
    pub token_env: Option<String>,
    pub api_url: Option<String>,
    pub send_interval_ms: Option<u64>,
    pub request_timeout_seconds: Option<u64>,
    /// Long-poll timeout passed to getUpdates
    pub poll_timeout_seconds: Option<u64>,
}

/// Limits applied to interactive commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub manual_news_requests: Option<u32>,
    pub manual_news_window_seconds: Option<u64>,
}

/// Hub catalog entry, overriding the built-in catalog when present
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub id: String,
    pub display_name: String,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub fetcher: Option<FetcherConfig>,
    pub telegram: Option<TelegramConfig>,
    pub limits: Option<LimitsConfig>,
    #[serde(default)]
    pub hubs: Vec<HubConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Fetcher section, or an all-defaults one when the file omits it.
    pub fn fetcher(&self) -> FetcherConfig {
        self.fetcher.clone().unwrap_or_default()
    }
}

/// Tables merge key by key; any other value in `b` replaces the one in `a`.
fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run the bundled SQL migrations (`/migrations` at the workspace root) against `pool`.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory and the DB file if necessary and returns a WAL-mode pool
/// with foreign keys enabled. Migrations are not run here; call `run_migrations`.
///
/// Example:
///   let pool = init_db_pool("data/hubcast.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// In-memory pool with migrations applied.
///
/// Every SQLite `:memory:` connection is its own database, so the pool is pinned to a
/// single connection that is never recycled.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open in-memory sqlite database")?;
    run_migrations(&pool).await?;
    Ok(pool)
}
