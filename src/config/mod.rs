//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "ukiyo";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_API_BASE: &str = "https://a.4cdn.org";
const DEFAULT_MEDIA_BASE: &str = "https://i.4cdn.org";
const DEFAULT_USER_AGENT: &str = concat!("ukiyo/", env!("CARGO_PKG_VERSION"));
const DEFAULT_MIN_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_CAP_MS: u64 = 8_000;
const DEFAULT_TTL_MINUTES: u64 = 10;
const DEFAULT_BOARDS_TTL_MINUTES: u64 = 60;
const DEFAULT_ARCHIVED_TTL_MINUTES: u64 = 24 * 60;
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_CAPACITY_MB: u64 = 500;
const DEFAULT_MAX_AGE_HOURS: u64 = 24;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3_600;
const DEFAULT_PREFETCH_THUMBS: usize = 20;

// Environment names honored by earlier deployments, applied after the
// layered build so they override file-sourced values.
const COMPAT_ENV_CACHE_TIME: &str = "CACHE_TIME";
const COMPAT_ENV_MAX_CACHE_SIZE: &str = "MAX_CACHE_SIZE";
const COMPAT_ENV_MAX_AGE: &str = "MAX_AGE";

/// Command-line arguments for the ukiyo binary.
#[derive(Debug, Parser)]
#[command(name = "ukiyo", version, about = "ukiyo imageboard mirror")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "UKIYO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the mirror HTTP service.
    Serve(Box<ServeArgs>),
    /// Run a single cache sweep over the data directory and exit.
    #[command(name = "sweep")]
    Sweep(SweepArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SweepArgs {
    /// Override the cache data directory.
    #[arg(long = "data-dir", value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Override the full-image capacity in megabytes.
    #[arg(long = "capacity-mb", value_name = "MB")]
    pub capacity_mb: Option<u64>,

    /// Override the maximum record age in hours.
    #[arg(long = "max-age-hours", value_name = "HOURS")]
    pub max_age_hours: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

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

    /// Override the upstream JSON API base URL.
    #[arg(long = "upstream-api-base", value_name = "URL")]
    pub upstream_api_base: Option<String>,

    /// Override the upstream media base URL.
    #[arg(long = "upstream-media-base", value_name = "URL")]
    pub upstream_media_base: Option<String>,

    /// Override the minimum spacing between upstream requests.
    #[arg(long = "upstream-min-interval-ms", value_name = "MILLIS")]
    pub upstream_min_interval_ms: Option<u64>,

    /// Override the per-attempt request timeout.
    #[arg(long = "upstream-timeout-seconds", value_name = "SECONDS")]
    pub upstream_timeout_seconds: Option<u64>,

    /// Override the retry budget for transient upstream failures.
    #[arg(long = "upstream-max-retries", value_name = "COUNT")]
    pub upstream_max_retries: Option<u32>,

    /// Override the metadata TTL in minutes.
    #[arg(long = "metadata-ttl-minutes", value_name = "MINUTES")]
    pub metadata_ttl_minutes: Option<u64>,

    /// Toggle serving stale metadata when the upstream is unavailable.
    #[arg(
        long = "metadata-stale-fallback",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub metadata_stale_fallback: Option<bool>,

    /// Override the cache data directory.
    #[arg(long = "data-dir", value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Override the full-image capacity in megabytes.
    #[arg(long = "capacity-mb", value_name = "MB")]
    pub capacity_mb: Option<u64>,

    /// Override the maximum record age in hours.
    #[arg(long = "max-age-hours", value_name = "HOURS")]
    pub max_age_hours: Option<u64>,

    /// Override the periodic sweep cadence.
    #[arg(long = "sweep-interval-seconds", value_name = "SECONDS")]
    pub sweep_interval_seconds: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub upstream: UpstreamSettings,
    pub metadata: MetadataSettings,
    pub images: ImageSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
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
pub struct UpstreamSettings {
    pub api_base: String,
    pub media_base: String,
    pub user_agent: String,
    pub min_interval: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

#[derive(Debug, Clone)]
pub struct MetadataSettings {
    pub ttl: Duration,
    pub boards_ttl: Duration,
    pub archived_ttl: Duration,
    pub stale_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct ImageSettings {
    pub data_dir: PathBuf,
    pub capacity_bytes: u64,
    pub max_age: Duration,
    pub sweep_interval: Duration,
    pub prefetch_thumbs: usize,
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

    builder = builder.add_source(Environment::with_prefix("UKIYO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_compat_env()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Sweep(args)) => raw.apply_sweep_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    upstream: RawUpstreamSettings,
    metadata: RawMetadataSettings,
    images: RawImageSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(base) = overrides.upstream_api_base.as_ref() {
            self.upstream.api_base = Some(base.clone());
        }
        if let Some(base) = overrides.upstream_media_base.as_ref() {
            self.upstream.media_base = Some(base.clone());
        }
        if let Some(millis) = overrides.upstream_min_interval_ms {
            self.upstream.min_interval_ms = Some(millis);
        }
        if let Some(seconds) = overrides.upstream_timeout_seconds {
            self.upstream.timeout_seconds = Some(seconds);
        }
        if let Some(count) = overrides.upstream_max_retries {
            self.upstream.max_retries = Some(count);
        }
        if let Some(minutes) = overrides.metadata_ttl_minutes {
            self.metadata.ttl_minutes = Some(minutes);
        }
        if let Some(enabled) = overrides.metadata_stale_fallback {
            self.metadata.stale_fallback = Some(enabled);
        }
        if let Some(dir) = overrides.data_dir.as_ref() {
            self.images.data_dir = Some(dir.clone());
        }
        if let Some(mb) = overrides.capacity_mb {
            self.images.capacity_mb = Some(mb);
        }
        if let Some(hours) = overrides.max_age_hours {
            self.images.max_age_hours = Some(hours);
        }
        if let Some(seconds) = overrides.sweep_interval_seconds {
            self.images.sweep_interval_seconds = Some(seconds);
        }
    }

    fn apply_sweep_overrides(&mut self, args: &SweepArgs) {
        if let Some(dir) = args.data_dir.as_ref() {
            self.images.data_dir = Some(dir.clone());
        }
        if let Some(mb) = args.capacity_mb {
            self.images.capacity_mb = Some(mb);
        }
        if let Some(hours) = args.max_age_hours {
            self.images.max_age_hours = Some(hours);
        }
    }

    fn apply_compat_env(&mut self) -> Result<(), LoadError> {
        if let Some(minutes) = compat_env_u64(COMPAT_ENV_CACHE_TIME, "metadata.ttl_minutes")? {
            self.metadata.ttl_minutes = Some(minutes);
        }
        if let Some(mb) = compat_env_u64(COMPAT_ENV_MAX_CACHE_SIZE, "images.capacity_mb")? {
            self.images.capacity_mb = Some(mb);
        }
        if let Some(hours) = compat_env_u64(COMPAT_ENV_MAX_AGE, "images.max_age_hours")? {
            self.images.max_age_hours = Some(hours);
        }
        Ok(())
    }
}

fn compat_env_u64(name: &str, key: &'static str) -> Result<Option<u64>, LoadError> {
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse::<u64>()
                .map_err(|err| LoadError::invalid(key, format!("`{name}`: {err}")))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            upstream,
            metadata,
            images,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let upstream = build_upstream_settings(upstream)?;
        let metadata = build_metadata_settings(metadata)?;
        let images = build_image_settings(images)?;

        Ok(Self {
            server,
            logging,
            upstream,
            metadata,
            images,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
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

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let api_base = base_url(upstream.api_base, DEFAULT_API_BASE, "upstream.api_base")?;
    let media_base = base_url(upstream.media_base, DEFAULT_MEDIA_BASE, "upstream.media_base")?;

    let user_agent = upstream
        .user_agent
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

    let min_interval_ms = upstream.min_interval_ms.unwrap_or(DEFAULT_MIN_INTERVAL_MS);
    if min_interval_ms == 0 {
        return Err(LoadError::invalid(
            "upstream.min_interval_ms",
            "must be greater than zero",
        ));
    }

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let max_retries = upstream.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);

    let backoff_base_ms = upstream.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS);
    if backoff_base_ms == 0 {
        return Err(LoadError::invalid(
            "upstream.backoff_base_ms",
            "must be greater than zero",
        ));
    }
    let backoff_cap_ms = upstream.backoff_cap_ms.unwrap_or(DEFAULT_BACKOFF_CAP_MS);
    if backoff_cap_ms < backoff_base_ms {
        return Err(LoadError::invalid(
            "upstream.backoff_cap_ms",
            "must be at least the backoff base",
        ));
    }

    Ok(UpstreamSettings {
        api_base,
        media_base,
        user_agent,
        min_interval: Duration::from_millis(min_interval_ms),
        request_timeout: Duration::from_secs(timeout_secs),
        max_retries,
        backoff_base: Duration::from_millis(backoff_base_ms),
        backoff_cap: Duration::from_millis(backoff_cap_ms),
    })
}

fn build_metadata_settings(metadata: RawMetadataSettings) -> Result<MetadataSettings, LoadError> {
    let ttl_minutes = metadata.ttl_minutes.unwrap_or(DEFAULT_TTL_MINUTES);
    let ttl = non_zero_minutes(ttl_minutes, "metadata.ttl_minutes")?;

    let boards_ttl = non_zero_minutes(
        metadata
            .boards_ttl_minutes
            .unwrap_or(DEFAULT_BOARDS_TTL_MINUTES),
        "metadata.boards_ttl_minutes",
    )?;

    let archived_ttl = non_zero_minutes(
        metadata
            .archived_ttl_minutes
            .unwrap_or(DEFAULT_ARCHIVED_TTL_MINUTES),
        "metadata.archived_ttl_minutes",
    )?;

    Ok(MetadataSettings {
        ttl,
        boards_ttl,
        archived_ttl,
        stale_fallback: metadata.stale_fallback.unwrap_or(true),
    })
}

fn build_image_settings(images: RawImageSettings) -> Result<ImageSettings, LoadError> {
    let data_dir = images
        .data_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    if data_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid("images.data_dir", "path must not be empty"));
    }

    let capacity_mb = images.capacity_mb.unwrap_or(DEFAULT_CAPACITY_MB);
    if capacity_mb == 0 {
        return Err(LoadError::invalid(
            "images.capacity_mb",
            "must be greater than zero",
        ));
    }
    let capacity_bytes = capacity_mb.checked_mul(1024 * 1024).ok_or_else(|| {
        LoadError::invalid("images.capacity_mb", "value exceeds supported range")
    })?;

    let max_age_hours = images.max_age_hours.unwrap_or(DEFAULT_MAX_AGE_HOURS);
    if max_age_hours == 0 {
        return Err(LoadError::invalid(
            "images.max_age_hours",
            "must be greater than zero",
        ));
    }

    let sweep_secs = images
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    if sweep_secs == 0 {
        return Err(LoadError::invalid(
            "images.sweep_interval_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ImageSettings {
        data_dir,
        capacity_bytes,
        max_age: Duration::from_secs(max_age_hours * 3_600),
        sweep_interval: Duration::from_secs(sweep_secs),
        prefetch_thumbs: images.prefetch_thumbs.unwrap_or(DEFAULT_PREFETCH_THUMBS),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    api_base: Option<String>,
    media_base: Option<String>,
    user_agent: Option<String>,
    min_interval_ms: Option<u64>,
    timeout_seconds: Option<u64>,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMetadataSettings {
    ttl_minutes: Option<u64>,
    boards_ttl_minutes: Option<u64>,
    archived_ttl_minutes: Option<u64>,
    stale_fallback: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawImageSettings {
    data_dir: Option<PathBuf>,
    capacity_mb: Option<u64>,
    max_age_hours: Option<u64>,
    sweep_interval_seconds: Option<u64>,
    prefetch_thumbs: Option<usize>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn base_url(value: Option<String>, default: &str, key: &'static str) -> Result<String, LoadError> {
    let candidate = value
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string());
    url::Url::parse(&candidate)
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{candidate}`: {err}")))?;
    Ok(candidate.trim_end_matches('/').to_string())
}

fn non_zero_minutes(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value * 60))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
