//! Typed configuration, built once at startup and passed explicitly into
//! every component.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

pub const DEFAULT_CONFIG_FILE: &str = "churchsync";
pub const ENV_PREFIX: &str = "CHURCHSYNC";

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Postgres connection string; falls back to `DATABASE_URL`
    #[serde(default)]
    pub database_url: String,

    /// Connect to Postgres over TLS
    #[serde(default)]
    pub database_tls: bool,

    /// Base URL of the remote platform, e.g. `https://example.church.tools`
    pub base_url: String,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Directory imported images are written to
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    /// Identifies this installation in rate-limit keys and logs
    #[serde(default = "default_installation_id")]
    pub installation_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Username/password login producing session cookies
    #[default]
    Password,
    /// Static API token sent as a bearer header
    Token,
}

#[derive(Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub method: AuthMethod,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("method", &self.method)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("token", &redacted(&self.token))
            .finish()
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncInterval {
    #[default]
    Hourly,
    TwiceDaily,
    Daily,
    Weekly,
}

impl SyncInterval {
    pub fn as_duration(&self) -> Duration {
        match self {
            SyncInterval::Hourly => Duration::from_secs(3600),
            SyncInterval::TwiceDaily => Duration::from_secs(12 * 3600),
            SyncInterval::Daily => Duration::from_secs(24 * 3600),
            SyncInterval::Weekly => Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// How many days before today the sync window starts
    #[serde(default = "default_days_past")]
    pub days_past: u32,

    /// How many days after today the sync window ends
    #[serde(default = "default_days_future")]
    pub days_future: u32,

    #[serde(default)]
    pub interval: SyncInterval,

    /// Overrides `interval` when set
    #[serde(default)]
    pub interval_secs: Option<u64>,

    /// Calendars to sync; empty means "whatever is selected in the store"
    #[serde(default)]
    pub selected_calendar_ids: Vec<i64>,

    /// Services to import; empty means all
    #[serde(default)]
    pub selected_service_ids: Vec<i64>,

    /// Refresh the calendar list before syncing events
    #[serde(default = "default_true")]
    pub refresh_calendars: bool,

    /// Sync history rows to keep
    #[serde(default = "default_history_retention")]
    pub history_retention: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            days_past: default_days_past(),
            days_future: default_days_future(),
            interval: SyncInterval::default(),
            interval_secs: None,
            selected_calendar_ids: Vec::new(),
            selected_service_ids: Vec::new(),
            refresh_calendars: true,
            history_retention: default_history_retention(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        match self.interval_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.interval.as_duration(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Disable limiting entirely (local development and tests)
    #[serde(default)]
    pub bypass: bool,

    #[serde(default = "default_short_limit")]
    pub short_limit: u32,

    #[serde(default = "default_short_window")]
    pub short_window_secs: u64,

    #[serde(default = "default_long_limit")]
    pub long_limit: u32,

    #[serde(default = "default_long_window")]
    pub long_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            bypass: false,
            short_limit: default_short_limit(),
            short_window_secs: default_short_window(),
            long_limit: default_long_limit(),
            long_window_secs: default_long_window(),
        }
    }
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("./media")
}

pub const DEFAULT_INSTALLATION_ID: &str = "default";

fn default_installation_id() -> String {
    DEFAULT_INSTALLATION_ID.to_string()
}

fn default_days_past() -> u32 {
    7
}

fn default_days_future() -> u32 {
    90
}

fn default_true() -> bool {
    true
}

fn default_history_retention() -> i64 {
    100
}

fn default_short_limit() -> u32 {
    60
}

fn default_short_window() -> u64 {
    60
}

fn default_long_limit() -> u32 {
    1000
}

fn default_long_window() -> u64 {
    3600
}

impl SyncConfig {
    /// Load `.env`, then an optional TOML file, then `CHURCHSYNC_*` variables.
    ///
    /// Nested keys use a double underscore: `CHURCHSYNC_AUTH__TOKEN`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut config: SyncConfig = settings
            .try_deserialize()
            .context("Configuration is incomplete or malformed")?;

        if config.database_url.is_empty() {
            config.database_url = std::env::var("DATABASE_URL").unwrap_or_default();
        }

        config.validate()?;
        Ok(config)
    }

    /// Configuration with defaults for everything but the remote endpoint
    pub fn new(base_url: impl Into<String>, auth: AuthConfig) -> Self {
        Self {
            database_url: String::new(),
            database_tls: false,
            base_url: base_url.into(),
            auth,
            sync: SyncSettings::default(),
            rate_limit: RateLimitConfig::default(),
            media_dir: default_media_dir(),
            installation_id: default_installation_id(),
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(SyncError::Config("base_url must be set".to_string()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "base_url must start with http:// or https://, got {}",
                base
            )));
        }
        if self.installation_id.trim().is_empty() {
            return Err(SyncError::Config(
                "installation_id must not be empty".to_string(),
            ));
        }
        if self.rate_limit.short_window_secs == 0 || self.rate_limit.long_window_secs == 0 {
            return Err(SyncError::Config(
                "rate limit windows must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.base_url.trim().trim_end_matches('/')
    }
}
