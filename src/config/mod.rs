//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::executor::RetryPolicy;
use crate::application::governor::GovernorConfig;
use crate::cache::CacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "esigate";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_UPSTREAM_BASE_URL: &str = "https://esi.evetech.net/latest";
const DEFAULT_UPSTREAM_USER_AGENT: &str = concat!("esigate/", env!("CARGO_PKG_VERSION"));
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_MAX: u32 = 3;
const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 30;
const DEFAULT_ERROR_LIMIT_TOTAL: u32 = 100;
const DEFAULT_WARN_THRESHOLD: f64 = 0.8;
const DEFAULT_SOFT_DELAY_MS: u64 = 500;
const DEFAULT_FAST_ENTRY_LIMIT: u64 = 2_048;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_REFRESH_CONCURRENCY: u32 = 4;
const DEFAULT_MAINTENANCE_CONCURRENCY: u32 = 2;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_EXPIRY_BUFFER_SECS: u64 = 300;
const DEFAULT_SCAN_INTERVAL_MINUTES: u32 = 2;
const DEFAULT_SSO_TOKEN_URL: &str = "https://login.eveonline.com/v2/oauth/token";
const DEFAULT_SSO_TIMEOUT_SECS: u64 = 10;

/// Command-line arguments for the esigate binary.
#[derive(Debug, Parser)]
#[command(name = "esigate", version, about = "ESI gateway service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ESIGATE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the gateway: worker pools, schedules and the refresh pipeline.
    Serve(Box<ServeArgs>),
    /// Queue an immediate token refresh for one character, then exit.
    Refresh(RefreshArgs),
    /// Sweep expired cache rows once, then exit.
    Sweep(SweepArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RefreshArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Character whose token should be refreshed.
    #[arg(long = "character-id", value_name = "ID")]
    pub character_id: i64,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SweepArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the upstream API base URL.
    #[arg(long = "upstream-base-url", value_name = "URL")]
    pub upstream_base_url: Option<String>,

    /// Override the User-Agent sent to the upstream.
    #[arg(long = "upstream-user-agent", value_name = "UA")]
    pub upstream_user_agent: Option<String>,

    /// Override the refresh worker pool concurrency.
    #[arg(long = "queues-refresh-concurrency", value_name = "COUNT")]
    pub refresh_concurrency: Option<u32>,

    /// Override the maintenance worker pool concurrency.
    #[arg(long = "queues-maintenance-concurrency", value_name = "COUNT")]
    pub maintenance_concurrency: Option<u32>,

    /// Override the token refresh scan interval in minutes.
    #[arg(long = "refresh-scan-interval-minutes", value_name = "MINUTES")]
    pub refresh_scan_interval_minutes: Option<u32>,

    /// Override the fast cache tier entry limit.
    #[arg(long = "cache-fast-entry-limit", value_name = "COUNT")]
    pub cache_fast_entry_limit: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub upstream: UpstreamSettings,
    pub retry: RetrySettings,
    pub governor: GovernorSettings,
    pub cache: CacheSettings,
    pub queues: QueuesSettings,
    pub refresh: RefreshSettings,
    pub sso: SsoSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

impl DatabaseSettings {
    /// The connection URL, required for every command.
    pub fn required_url(&self) -> Result<&str, LoadError> {
        self.url
            .as_deref()
            .ok_or_else(|| LoadError::invalid("database.url", "connection URL is required"))
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            multiplier: self.multiplier,
            max_delay: self.max_delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GovernorSettings {
    pub error_limit_total: u32,
    pub warn_threshold: f64,
    pub soft_delay: Duration,
}

impl GovernorSettings {
    pub fn config(&self) -> GovernorConfig {
        GovernorConfig {
            error_limit_total: self.error_limit_total,
            warn_threshold: self.warn_threshold,
            soft_delay: self.soft_delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub fast_tier_enabled: bool,
    pub fast_entry_limit: u64,
    pub default_ttl: Duration,
}

impl CacheSettings {
    pub fn config(&self) -> CacheConfig {
        CacheConfig {
            enable_fast_tier: self.fast_tier_enabled,
            fast_entry_limit: self.fast_entry_limit as usize,
            default_ttl: self.default_ttl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuesSettings {
    pub refresh_concurrency: NonZeroU32,
    pub maintenance_concurrency: NonZeroU32,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub expiry_buffer: Duration,
    pub scan_interval_minutes: u32,
}

impl RefreshSettings {
    /// Cron expression for the periodic refresh scan.
    pub fn scan_expression(&self) -> String {
        format!("0 */{} * * * *", self.scan_interval_minutes)
    }
}

#[derive(Debug, Clone)]
pub struct SsoSettings {
    pub token_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("ESIGATE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Refresh(args)) => raw.apply_database_override(&args.database),
        Some(Command::Sweep(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    upstream: RawUpstreamSettings,
    retry: RawRetrySettings,
    governor: RawGovernorSettings,
    cache: RawCacheSettings,
    queues: RawQueuesSettings,
    refresh: RawRefreshSettings,
    sso: RawSsoSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(url) = overrides.upstream_base_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }
        if let Some(agent) = overrides.upstream_user_agent.as_ref() {
            self.upstream.user_agent = Some(agent.clone());
        }
        if let Some(value) = overrides.refresh_concurrency {
            self.queues.refresh_concurrency = Some(value);
        }
        if let Some(value) = overrides.maintenance_concurrency {
            self.queues.maintenance_concurrency = Some(value);
        }
        if let Some(value) = overrides.refresh_scan_interval_minutes {
            self.refresh.scan_interval_minutes = Some(value);
        }
        if let Some(value) = overrides.cache_fast_entry_limit {
            self.cache.fast_entry_limit = Some(value);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            upstream,
            retry,
            governor,
            cache,
            queues,
            refresh,
            sso,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            upstream: build_upstream_settings(upstream)?,
            retry: build_retry_settings(retry)?,
            governor: build_governor_settings(governor)?,
            cache: build_cache_settings(cache)?,
            queues: build_queues_settings(queues)?,
            refresh: build_refresh_settings(refresh)?,
            sso: build_sso_settings(sso)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let base_url = upstream
        .base_url
        .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string());
    if base_url.trim().is_empty() {
        return Err(LoadError::invalid("upstream.base_url", "must not be empty"));
    }

    let user_agent = upstream
        .user_agent
        .unwrap_or_else(|| DEFAULT_UPSTREAM_USER_AGENT.to_string());

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        base_url: base_url.trim_end_matches('/').to_string(),
        user_agent,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_retry_settings(retry: RawRetrySettings) -> Result<RetrySettings, LoadError> {
    let multiplier = retry.multiplier.unwrap_or(DEFAULT_RETRY_MULTIPLIER);
    if multiplier < 1.0 {
        return Err(LoadError::invalid(
            "retry.multiplier",
            "must be at least 1.0",
        ));
    }

    Ok(RetrySettings {
        max_retries: retry.max_retries.unwrap_or(DEFAULT_RETRY_MAX),
        initial_delay: Duration::from_millis(
            retry
                .initial_delay_ms
                .unwrap_or(DEFAULT_RETRY_INITIAL_DELAY_MS),
        ),
        multiplier,
        max_delay: Duration::from_secs(
            retry
                .max_delay_seconds
                .unwrap_or(DEFAULT_RETRY_MAX_DELAY_SECS),
        ),
    })
}

fn build_governor_settings(governor: RawGovernorSettings) -> Result<GovernorSettings, LoadError> {
    let error_limit_total = governor
        .error_limit_total
        .unwrap_or(DEFAULT_ERROR_LIMIT_TOTAL);
    if error_limit_total == 0 {
        return Err(LoadError::invalid(
            "governor.error_limit_total",
            "must be greater than zero",
        ));
    }

    let warn_threshold = governor.warn_threshold.unwrap_or(DEFAULT_WARN_THRESHOLD);
    if !(0.0..=1.0).contains(&warn_threshold) || warn_threshold == 0.0 {
        return Err(LoadError::invalid(
            "governor.warn_threshold",
            "must be within (0, 1]",
        ));
    }

    Ok(GovernorSettings {
        error_limit_total,
        warn_threshold,
        soft_delay: Duration::from_millis(
            governor.soft_delay_ms.unwrap_or(DEFAULT_SOFT_DELAY_MS),
        ),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let fast_entry_limit = cache.fast_entry_limit.unwrap_or(DEFAULT_FAST_ENTRY_LIMIT);
    if fast_entry_limit == 0 {
        return Err(LoadError::invalid(
            "cache.fast_entry_limit",
            "must be greater than zero",
        ));
    }
    usize::try_from(fast_entry_limit).map_err(|_| {
        LoadError::invalid(
            "cache.fast_entry_limit",
            "value exceeds supported range for usize",
        )
    })?;

    let default_ttl_seconds = cache.default_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS);
    if default_ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.default_ttl_seconds",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        fast_tier_enabled: cache.fast_tier_enabled.unwrap_or(true),
        fast_entry_limit,
        default_ttl: Duration::from_secs(default_ttl_seconds),
    })
}

fn build_queues_settings(queues: RawQueuesSettings) -> Result<QueuesSettings, LoadError> {
    let refresh = queues
        .refresh_concurrency
        .unwrap_or(DEFAULT_REFRESH_CONCURRENCY);
    let maintenance = queues
        .maintenance_concurrency
        .unwrap_or(DEFAULT_MAINTENANCE_CONCURRENCY);
    let poll_interval_ms = queues.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_interval_ms == 0 {
        return Err(LoadError::invalid(
            "queues.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(QueuesSettings {
        refresh_concurrency: non_zero_u32(refresh.into(), "queues.refresh_concurrency")?,
        maintenance_concurrency: non_zero_u32(
            maintenance.into(),
            "queues.maintenance_concurrency",
        )?,
        poll_interval: Duration::from_millis(poll_interval_ms),
    })
}

fn build_refresh_settings(refresh: RawRefreshSettings) -> Result<RefreshSettings, LoadError> {
    let scan_interval_minutes = refresh
        .scan_interval_minutes
        .unwrap_or(DEFAULT_SCAN_INTERVAL_MINUTES);
    if !(1..=59).contains(&scan_interval_minutes) {
        return Err(LoadError::invalid(
            "refresh.scan_interval_minutes",
            "must be between 1 and 59",
        ));
    }

    let expiry_buffer_seconds = refresh
        .expiry_buffer_seconds
        .unwrap_or(DEFAULT_EXPIRY_BUFFER_SECS);
    if expiry_buffer_seconds == 0 {
        return Err(LoadError::invalid(
            "refresh.expiry_buffer_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RefreshSettings {
        expiry_buffer: Duration::from_secs(expiry_buffer_seconds),
        scan_interval_minutes,
    })
}

fn build_sso_settings(sso: RawSsoSettings) -> Result<SsoSettings, LoadError> {
    let token_url = sso
        .token_url
        .unwrap_or_else(|| DEFAULT_SSO_TOKEN_URL.to_string());
    if token_url.trim().is_empty() {
        return Err(LoadError::invalid("sso.token_url", "must not be empty"));
    }

    let timeout_secs = sso.timeout_seconds.unwrap_or(DEFAULT_SSO_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "sso.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(SsoSettings {
        token_url,
        client_id: sso.client_id,
        client_secret: sso.client_secret,
        timeout: Duration::from_secs(timeout_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    user_agent: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetrySettings {
    max_retries: Option<u32>,
    initial_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    max_delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGovernorSettings {
    error_limit_total: Option<u32>,
    warn_threshold: Option<f64>,
    soft_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    fast_tier_enabled: Option<bool>,
    fast_entry_limit: Option<u64>,
    default_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueuesSettings {
    refresh_concurrency: Option<u32>,
    maintenance_concurrency: Option<u32>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRefreshSettings {
    expiry_buffer_seconds: Option<u64>,
    scan_interval_minutes: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSsoSettings {
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    timeout_seconds: Option<u64>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
