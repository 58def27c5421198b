use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::Storage;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "assetcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the asset cache tiers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity (in bytes) of the in-memory tier.
    ///
    /// The in-memory size limit is a best-effort approximation, and not an exact limit.
    ///
    /// Defaults to `100 MiB (= 104_857_600)`.
    pub in_memory_capacity: u64,

    /// Maximum duration since last use of a file on disk.
    ///
    /// Files that were not used for longer are removed by a cleanup. `None` keeps them forever.
    ///
    /// Defaults to `7d`.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            in_memory_capacity: 100 * 1024 * 1024,
            max_unused_for: Some(Duration::from_secs(3600 * 24 * 7)),
        }
    }
}

/// Settings of the built-in HTTP fetcher.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// The maximum time a single download may take.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            user_agent: concat!("assetcache/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

/// Default delays of a [`Debouncer`](crate::debounce::Debouncer).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DebounceConfig {
    /// Delay before the first execution of a burst.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Delay after a run that superseded a pending execution.
    #[serde(with = "humantime_serde")]
    pub overlap_delay: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(300),
            overlap_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the temporary cache storage.
    ///
    /// Defaults to the system temp directory.
    pub temporary_dir: PathBuf,

    /// Root of the durable cache storage.
    ///
    /// Defaults to the user's cache directory, or the temporary one if there is none.
    pub durable_dir: PathBuf,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune the cache tiers.
    pub caches: CacheConfig,

    /// Settings of the HTTP fetcher.
    pub fetch: FetchConfig,

    /// Default debounce delays.
    pub debounce: DebounceConfig,
}

impl Default for Config {
    fn default() -> Self {
        let temporary_dir = env::temp_dir();
        Config {
            durable_dir: dirs::cache_dir().unwrap_or_else(|| temporary_dir.clone()),
            temporary_dir,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfig::default(),
            fetch: FetchConfig::default(),
            debounce: DebounceConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The root directory for the given kind of storage.
    pub fn storage_dir(&self, storage: Storage) -> &Path {
        match storage {
            Storage::Temporary => &self.temporary_dir,
            Storage::Durable => &self.durable_dir,
        }
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        // Setting one field keeps the defaults of the others.
        let yaml = r#"
            caches:
              max_unused_for: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.max_unused_for, Some(Duration::from_secs(3600)));
        assert_eq!(
            cfg.caches.in_memory_capacity,
            CacheConfig::default().in_memory_capacity
        );
        assert_eq!(cfg.fetch, FetchConfig::default());
    }

    #[test]
    fn test_disabling_expiry() {
        let yaml = r#"
            caches:
              max_unused_for: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.max_unused_for, None);
    }

    #[test]
    fn test_debounce_and_fetch() {
        let yaml = r#"
            debounce:
              initial_delay: 100ms
              overlap_delay: 1s
            fetch:
              connect_timeout: 0s
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.debounce.initial_delay, Duration::from_millis(100));
        assert_eq!(cfg.debounce.overlap_delay, Duration::from_secs(1));
        assert_eq!(cfg.fetch.connect_timeout, Duration::from_secs(0));
        assert_eq!(cfg.fetch.timeout, FetchConfig::default().timeout);
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_storage_dirs() {
        let yaml = r#"
            temporary_dir: /tmp/assets
            durable_dir: /var/cache/assets
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.storage_dir(Storage::Temporary),
            Path::new("/tmp/assets")
        );
        assert_eq!(
            cfg.storage_dir(Storage::Durable),
            Path::new("/var/cache/assets")
        );
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_cache:
                max_unused_for: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
