//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "kvs";
const ENV_PREFIX: &str = "KVS";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_BUS_CAPACITY: u64 = 1024;
const DEFAULT_RESUBSCRIBE_BACKOFF_MS: u64 = 1_000;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_BUS_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_PUBLISH_ATTEMPTS: u64 = 3;
const DEFAULT_PUBLISH_BACKOFF_MS: u64 = 50;

/// Command-line arguments for the kvs binary.
#[derive(Debug, Parser)]
#[command(name = "kvs", version, about = "Eventually consistent key-value node")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "KVS_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a node: HTTP API plus invalidation listener.
    Serve(Box<ServeArgs>),
    /// Apply pending database migrations and exit.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
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

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Durable store backend (postgres|memory).
    #[arg(long = "store-backend", value_name = "BACKEND")]
    pub store_backend: Option<String>,

    /// Invalidation bus backend (postgres|memory).
    #[arg(long = "bus-backend", value_name = "BACKEND")]
    pub bus_backend: Option<String>,

    /// Override the per-call durable store timeout.
    #[arg(long = "cache-store-timeout-ms", value_name = "MILLIS")]
    pub cache_store_timeout_ms: Option<u64>,

    /// Override the number of publish attempts per write.
    #[arg(long = "cache-publish-attempts", value_name = "COUNT")]
    pub cache_publish_attempts: Option<u64>,

    /// Toggle loading every durable entry before serving.
    #[arg(
        long = "cache-warm-on-startup",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_warm_on_startup: Option<bool>,

    /// Toggle loading uncached keys from the durable store on read.
    #[arg(
        long = "cache-read-through-on-miss",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_read_through_on_miss: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub store: StoreSettings,
    pub bus: BusSettings,
    pub cache: CacheSettings,
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
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

/// Which implementation backs a seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    /// Process-local; only meaningful for a single node.
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            "memory" => Ok(Backend::Memory),
            other => Err(format!("unknown backend `{other}` (expected postgres or memory)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: Backend,
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub backend: Backend,
    /// Buffered messages per subscriber for the memory backend.
    pub capacity: usize,
    pub resubscribe_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub store_timeout: Duration,
    pub bus_timeout: Duration,
    pub publish_attempts: NonZeroU32,
    pub publish_backoff: Duration,
    pub warm_on_startup: bool,
    pub read_through_on_miss: bool,
}

impl Settings {
    /// Whether any seam needs a database connection.
    pub fn requires_database(&self) -> bool {
        self.store.backend == Backend::Postgres || self.bus.backend == Backend::Postgres
    }
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

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    store: RawStoreSettings,
    bus: RawBusSettings,
    cache: RawCacheSettings,
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
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(backend) = overrides.store_backend.as_ref() {
            self.store.backend = Some(backend.clone());
        }
        if let Some(backend) = overrides.bus_backend.as_ref() {
            self.bus.backend = Some(backend.clone());
        }
        if let Some(timeout) = overrides.cache_store_timeout_ms {
            self.cache.store_timeout_ms = Some(timeout);
        }
        if let Some(attempts) = overrides.cache_publish_attempts {
            self.cache.publish_attempts = Some(attempts);
        }
        if let Some(warm) = overrides.cache_warm_on_startup {
            self.cache.warm_on_startup = Some(warm);
        }
        if let Some(read_through) = overrides.cache_read_through_on_miss {
            self.cache.read_through_on_miss = Some(read_through);
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
            server,
            logging,
            database,
            store,
            bus,
            cache,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            store: build_store_settings(store)?,
            bus: build_bus_settings(bus)?,
            cache: build_cache_settings(cache)?,
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

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    Ok(StoreSettings {
        backend: parse_backend(store.backend, "store.backend")?,
    })
}

fn build_bus_settings(bus: RawBusSettings) -> Result<BusSettings, LoadError> {
    let backend = parse_backend(bus.backend, "bus.backend")?;

    let capacity_value = bus.capacity.unwrap_or(DEFAULT_BUS_CAPACITY);
    if capacity_value == 0 {
        return Err(LoadError::invalid("bus.capacity", "must be greater than zero"));
    }
    let capacity = usize::try_from(capacity_value).map_err(|_| {
        LoadError::invalid("bus.capacity", "value exceeds supported range for usize")
    })?;

    let backoff_ms = bus
        .resubscribe_backoff_ms
        .unwrap_or(DEFAULT_RESUBSCRIBE_BACKOFF_MS);
    if backoff_ms == 0 {
        return Err(LoadError::invalid(
            "bus.resubscribe_backoff_ms",
            "must be greater than zero",
        ));
    }

    Ok(BusSettings {
        backend,
        capacity,
        resubscribe_backoff: Duration::from_millis(backoff_ms),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let store_timeout = positive_millis(
        cache.store_timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
        "cache.store_timeout_ms",
    )?;
    let bus_timeout = positive_millis(
        cache.bus_timeout_ms.unwrap_or(DEFAULT_BUS_TIMEOUT_MS),
        "cache.bus_timeout_ms",
    )?;
    let publish_attempts = non_zero_u32(
        cache.publish_attempts.unwrap_or(DEFAULT_PUBLISH_ATTEMPTS),
        "cache.publish_attempts",
    )?;
    let publish_backoff = Duration::from_millis(
        cache
            .publish_backoff_ms
            .unwrap_or(DEFAULT_PUBLISH_BACKOFF_MS),
    );

    Ok(CacheSettings {
        store_timeout,
        bus_timeout,
        publish_attempts,
        publish_backoff,
        warm_on_startup: cache.warm_on_startup.unwrap_or(true),
        read_through_on_miss: cache.read_through_on_miss.unwrap_or(false),
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
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBusSettings {
    backend: Option<String>,
    capacity: Option<u64>,
    resubscribe_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    store_timeout_ms: Option<u64>,
    bus_timeout_ms: Option<u64>,
    publish_attempts: Option<u64>,
    publish_backoff_ms: Option<u64>,
    warm_on_startup: Option<bool>,
    read_through_on_miss: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_backend(value: Option<String>, key: &'static str) -> Result<Backend, LoadError> {
    match value {
        Some(value) => value
            .parse()
            .map_err(|reason: String| LoadError::invalid(key, reason)),
        None => Ok(Backend::Postgres),
    }
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
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

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
