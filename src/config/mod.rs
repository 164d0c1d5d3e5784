//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::{
    Args, Parser, Subcommand,
    builder::{BoolishValueParser, RangedU64ValueParser},
};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheConfig, Resource};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cabinet";
const ENV_PREFIX: &str = "CABINET";
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROBE_READERS: usize = 4;
pub const MAX_PROBE_READERS: u64 = 64;
const DEFAULT_PROBE_ROUNDS: u32 = 2;

/// Command-line arguments for the cabinet binary.
#[derive(Debug, Parser)]
#[command(
    name = "cabinet",
    version,
    about = "Stale-while-revalidate data cache for the label cabinet"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CABINET_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Read one backend resource through the cache from several concurrent readers.
    Probe(Box<ProbeArgs>),
    /// Print the resolved settings.
    Config(ConfigArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub overrides: SettingsOverrides,

    /// Resource to read (releases|tickets|payouts|news|profiles).
    #[arg(value_name = "RESOURCE")]
    pub resource: Resource,

    /// Query string passed to the backend, e.g. `select=*&limit=20`.
    #[arg(long, value_name = "QUERY")]
    pub query: Option<String>,

    /// Number of readers issuing the same read concurrently (1-64).
    #[arg(
        long,
        default_value_t = DEFAULT_PROBE_READERS,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..=MAX_PROBE_READERS)
    )]
    pub readers: usize,

    /// Number of read rounds; rounds after the first exercise freshness.
    #[arg(long, default_value_t = DEFAULT_PROBE_ROUNDS)]
    pub rounds: u32,

    /// Pause between rounds.
    #[arg(long = "interval-ms", value_name = "MS", default_value_t = 0)]
    pub interval_ms: u64,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub overrides: SettingsOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SettingsOverrides {
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

    /// Override the backend base URL.
    #[arg(long = "backend-url", value_name = "URL")]
    pub backend_url: Option<String>,

    /// Override the backend API key.
    #[arg(long = "backend-api-key", env = "CABINET_BACKEND_API_KEY", value_name = "KEY")]
    pub backend_api_key: Option<String>,

    /// Override the backend request timeout.
    #[arg(long = "backend-timeout-ms", value_name = "MS")]
    pub backend_timeout_ms: Option<u64>,

    /// Toggle the cache; when off every read goes to the backend.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the default time-to-live of cache entries.
    #[arg(long = "cache-stale-after-ms", value_name = "MS")]
    pub cache_stale_after_ms: Option<u64>,

    /// Override the cache capacity.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<usize>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub backend: BackendSettings,
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

#[derive(Clone)]
pub struct BackendSettings {
    pub base_url: Option<Url>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
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
        Some(Command::Probe(args)) => raw.apply_overrides(&args.overrides),
        Some(Command::Config(args)) => raw.apply_overrides(&args.overrides),
        None => raw.apply_overrides(&SettingsOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    backend: RawBackendSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &SettingsOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.backend_url.as_ref() {
            self.backend.url = Some(url.clone());
        }
        if let Some(key) = overrides.backend_api_key.as_ref() {
            self.backend.api_key = Some(key.clone());
        }
        if let Some(timeout) = overrides.backend_timeout_ms {
            self.backend.timeout_ms = Some(timeout);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(stale_after) = overrides.cache_stale_after_ms {
            self.cache.stale_after_ms = Some(stale_after);
        }
        if let Some(max) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            backend,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let backend = build_backend_settings(backend)?;

        Ok(Self {
            logging,
            cache,
            backend,
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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let max_entries = match cache.max_entries {
        Some(value) => non_zero_usize(value, "cache.max_entries")?.get(),
        None => defaults.max_entries,
    };

    Ok(CacheConfig {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        stale_after_ms: cache.stale_after_ms.unwrap_or(defaults.stale_after_ms),
        max_entries,
    })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let base_url = match non_blank(backend.url) {
        Some(value) => Some(parse_base_url(&value)?),
        None => None,
    };
    let api_key = non_blank(backend.api_key);

    let timeout_ms = backend.timeout_ms.unwrap_or(DEFAULT_BACKEND_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "backend.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(BackendSettings {
        base_url,
        api_key,
        timeout: Duration::from_millis(timeout_ms),
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
struct RawCacheSettings {
    enabled: Option<bool>,
    stale_after_ms: Option<u64>,
    max_entries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    url: Option<String>,
    api_key: Option<String>,
    timeout_ms: Option<u64>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_base_url(value: &str) -> Result<Url, LoadError> {
    let url = Url::parse(value)
        .map_err(|err| LoadError::invalid("backend.url", format!("invalid URL `{value}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "backend.url",
            format!("unsupported scheme `{}`", url.scheme()),
        ));
    }
    Ok(url)
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert!(matches!(settings.logging.format, LogFormat::Compact));
        assert!(settings.cache.enabled);
        assert_eq!(settings.cache.stale_after_ms, 300_000);
        assert_eq!(settings.cache.max_entries, 1024);
        assert!(settings.backend.base_url.is_none());
        assert_eq!(
            settings.backend.timeout,
            Duration::from_millis(DEFAULT_BACKEND_TIMEOUT_MS)
        );
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.cache.stale_after_ms = Some(60_000);
        raw.logging.level = Some("info".to_string());

        let overrides = SettingsOverrides {
            cache_stale_after_ms: Some(1_000),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        raw.apply_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.cache.stale_after_ms, 1_000);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        raw.apply_overrides(&SettingsOverrides {
            log_json: Some(true),
            ..Default::default()
        });
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn zero_capacity_is_rejected_with_key() {
        let mut raw = RawSettings::default();
        raw.cache.max_entries = Some(0);

        match Settings::from_raw(raw) {
            Err(LoadError::Invalid { key, .. }) => assert_eq!(key, "cache.max_entries"),
            other => panic!("expected invalid cache.max_entries, got {other:?}"),
        }
    }

    #[test]
    fn backend_url_must_be_http() {
        let mut raw = RawSettings::default();
        raw.backend.url = Some("ftp://example.org".to_string());
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid {
                key: "backend.url",
                ..
            })
        ));

        let mut raw = RawSettings::default();
        raw.backend.url = Some("  https://project.example.co  ".to_string());
        raw.backend.api_key = Some("   ".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(
            settings.backend.base_url.as_ref().map(Url::as_str),
            Some("https://project.example.co/")
        );
        assert!(settings.backend.api_key.is_none());
    }

    #[test]
    fn backend_debug_redacts_api_key() {
        let backend = BackendSettings {
            base_url: None,
            api_key: Some("secret-key".to_string()),
            timeout: Duration::from_secs(1),
        };
        let rendered = format!("{backend:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn parse_probe_arguments() {
        let args = CliArgs::parse_from([
            "cabinet",
            "probe",
            "tickets",
            "--readers",
            "8",
            "--query",
            "status=eq.open",
            "--backend-url",
            "https://project.example.co",
        ]);

        match args.command.expect("probe command") {
            Command::Probe(probe) => {
                assert_eq!(probe.resource, Resource::Tickets);
                assert_eq!(probe.readers, 8);
                assert_eq!(probe.rounds, DEFAULT_PROBE_ROUNDS);
                assert_eq!(probe.query.as_deref(), Some("status=eq.open"));
                assert_eq!(
                    probe.overrides.backend_url.as_deref(),
                    Some("https://project.example.co")
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn probe_rejects_reader_counts_out_of_range() {
        for readers in ["0", "65"] {
            let error = CliArgs::try_parse_from(["cabinet", "probe", "news", "--readers", readers])
                .expect_err("reader count out of range");
            assert_eq!(error.kind(), clap::error::ErrorKind::ValueValidation);
        }
        let args = CliArgs::parse_from(["cabinet", "probe", "news", "--readers", "64"]);
        match args.command.expect("probe command") {
            Command::Probe(probe) => assert_eq!(probe.readers, 64),
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn probe_rejects_unknown_resource() {
        assert!(CliArgs::try_parse_from(["cabinet", "probe", "royalties"]).is_err());
    }

    #[test]
    fn parse_config_arguments() {
        let args = CliArgs::parse_from(["cabinet", "config", "--cache-enabled", "false"]);
        match args.command.expect("config command") {
            Command::Config(config) => {
                assert_eq!(config.overrides.cache_enabled, Some(false));
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
