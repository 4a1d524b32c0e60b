//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::operation::{DEFAULT_CACHE_DURATION, OperationPredicate, ParsePredicateError};
use crate::serialisation::DEFAULT_COMPRESSION_LEVEL;
use crate::store::DEFAULT_MAX_ENTRIES;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "recall";
const ENV_PREFIX: &str = "RECALL";
const DEFAULT_CACHE_DIRECTORY: &str = "cache";
const DEFAULT_DATABASE_URL: &str = "sqlite://recall.db";

/// Command-line arguments for the `recall` maintenance binary.
#[derive(Debug, Parser)]
#[command(name = "recall", version, about = "Inspect and maintain a response cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RECALL_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Summarise stored entries by type and freshness.
    Stats,
    /// Remove entries, optionally restricted to one response type or to expired entries.
    Clear(ClearArgs),
    /// Mark the entry for one request as expired.
    Invalidate(InvalidateArgs),
    /// Remove every expired entry.
    #[command(name = "purge-stale")]
    PurgeStale,
}

#[derive(Debug, Args, Clone, Default)]
pub struct ClearArgs {
    /// Only remove entries of this response type.
    #[arg(long = "type", value_name = "NAME")]
    pub type_name: Option<String>,

    /// Only remove entries that have expired.
    #[arg(long = "stale-only", action = clap::ArgAction::SetTrue)]
    pub stale_only: bool,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    /// HTTP method of the cached request.
    #[arg(long, default_value = "GET")]
    pub method: String,

    /// URL of the cached request.
    #[arg(long, value_name = "URL")]
    pub url: String,

    /// Request body, for requests that carried one.
    #[arg(long, value_name = "BODY")]
    pub body: Option<String>,

    /// Response type the entry was cached as.
    #[arg(long = "type", value_name = "NAME")]
    pub type_name: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the storage backend (memory|file|sqlite).
    #[arg(long = "store-backend", value_name = "BACKEND", global = true)]
    pub store_backend: Option<String>,

    /// Override the directory used by the file backend.
    #[arg(long = "store-directory", value_name = "PATH", global = true)]
    pub store_directory: Option<PathBuf>,

    /// Override the sqlite connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Override the in-memory backend capacity.
    #[arg(long = "memory-max-entries", value_name = "COUNT", global = true)]
    pub memory_max_entries: Option<usize>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Global cache defaults. Per-call options take precedence over these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub default_duration: Duration,
    pub encrypt_by_default: bool,
    pub compress_by_default: bool,
    /// Fail calls whose response type cannot carry metadata.
    pub require_metadata: bool,
    /// Refuse to store plaintext when encryption was requested but is unavailable.
    pub require_encryption: bool,
    pub compression_level: u32,
    pub predicate: OperationPredicate,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_duration: DEFAULT_CACHE_DURATION,
            encrypt_by_default: false,
            compress_by_default: false,
            require_metadata: false,
            require_encryption: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            predicate: OperationPredicate::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!(
                "unknown backend `{other}` (expected memory, file or sqlite)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub memory_max_entries: usize,
    pub directory: PathBuf,
    pub database_url: String,
}

impl StoreSettings {
    /// The file backend keeps no type column, so payloads carry the type name themselves.
    pub fn embeds_type_header(&self) -> bool {
        self.backend == StoreBackend::File
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            memory_max_entries: DEFAULT_MAX_ENTRIES,
            directory: PathBuf::from(DEFAULT_CACHE_DIRECTORY),
            database_url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
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
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    store: RawStoreSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(backend) = overrides.store_backend.as_ref() {
            self.store.backend = Some(backend.clone());
        }
        if let Some(directory) = overrides.store_directory.as_ref() {
            self.store.directory = Some(directory.clone());
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.store.database_url = Some(url.clone());
        }
        if let Some(max_entries) = overrides.memory_max_entries {
            self.store.memory_max_entries = Some(max_entries);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            cache: build_cache_settings(raw.cache)?,
            store: build_store_settings(raw.store)?,
            logging: build_logging_settings(raw.logging)?,
        })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheSettings::default();

    let default_duration = match cache.default_duration_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.default_duration_seconds",
                "must be greater than zero",
            ));
        }
        Some(seconds) => Duration::from_secs(seconds),
        None => defaults.default_duration,
    };

    let compression_level = match cache.compression_level {
        Some(level) if level > 9 => {
            return Err(LoadError::invalid(
                "cache.compression_level",
                "must be between 0 and 9",
            ));
        }
        Some(level) => level,
        None => defaults.compression_level,
    };

    let predicate = match cache.default_operation {
        Some(value) => value
            .parse()
            .map_err(|err: ParsePredicateError| {
                LoadError::invalid("cache.default_operation", err.to_string())
            })?,
        None => defaults.predicate,
    };

    Ok(CacheSettings {
        default_duration,
        encrypt_by_default: cache
            .encrypt_by_default
            .unwrap_or(defaults.encrypt_by_default),
        compress_by_default: cache
            .compress_by_default
            .unwrap_or(defaults.compress_by_default),
        require_metadata: cache.require_metadata.unwrap_or(defaults.require_metadata),
        require_encryption: cache
            .require_encryption
            .unwrap_or(defaults.require_encryption),
        compression_level,
        predicate,
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let defaults = StoreSettings::default();

    let backend = match store.backend {
        Some(value) => value
            .parse()
            .map_err(|reason: String| LoadError::invalid("store.backend", reason))?,
        None => defaults.backend,
    };

    let database_url = store
        .database_url
        .and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or(defaults.database_url);

    let directory = store.directory.unwrap_or(defaults.directory);
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid("store.directory", "must not be empty"));
    }

    Ok(StoreSettings {
        backend,
        // Zero is raised to one by the memory store.
        memory_max_entries: store.memory_max_entries.unwrap_or(defaults.memory_max_entries),
        directory,
        database_url,
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

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    default_duration_seconds: Option<u64>,
    encrypt_by_default: Option<bool>,
    compress_by_default: Option<bool>,
    require_metadata: Option<bool>,
    require_encryption: Option<bool>,
    compression_level: Option<u32>,
    default_operation: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
    memory_max_entries: Option<usize>,
    directory: Option<PathBuf>,
    database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[cfg(test)]
mod tests;
