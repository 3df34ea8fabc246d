use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `Pretty` when attached to a terminal, `Simplified` otherwise.
    Auto,
    Pretty,
    /// Compact single-line output.
    Simplified,
    /// One JSON object per line.
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Lowest level that is logged, unless overridden by `RUST_LOG`.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Forces `RUST_BACKTRACE=1`.
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

/// Where and how metrics are reported.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of a statsd server. Metrics are discarded without one.
    pub statsd: Option<String>,
    pub prefix: String,
    /// Tags sent along with every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "netquery".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Default timings of queries.
///
/// A duration of `None` (`null` in YAML) means "never".
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    /// How long a successful result counts as fresh.
    ///
    /// `0s` makes every result stale right away, so that every observer refetches.
    #[serde(with = "humantime_serde")]
    pub stale_time: Option<Duration>,

    /// How long an entry without subscribers is kept around before it is evicted.
    #[serde(with = "humantime_serde")]
    pub gc_time: Option<Duration>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Some(Duration::ZERO),
            gc_time: Some(Duration::from_secs(5 * 60)),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for the logging system.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Default timings of all queries.
    pub queries: QueryConfig,
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
}

const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    level
        .parse()
        .map_err(|_| de::Error::unknown_variant(&level, LEVELS))
}
