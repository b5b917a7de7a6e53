use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

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
    /// The log level for the service.
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
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "snapshotter".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The maximum number of render contexts that may be open at the same time.
    ///
    /// Requests past this limit wait for a context to be released, in arrival order.
    pub max_render_contexts: usize,

    /// How long a request may wait for a free render context before it is rejected.
    ///
    /// Defaults to `None`, which waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub context_acquire_timeout: Option<Duration>,

    /// The maximum number of auxiliary asset fetches a single request may have in
    /// flight at the same time.
    pub max_fetch_concurrency: usize,

    /// How long a deduplicated render result is kept around.
    ///
    /// Requests carrying the same identity token within this window share a single
    /// render.
    #[serde(with = "humantime_serde")]
    pub dedup_max_age: Duration,

    /// The interval at which expired entries are swept out of the dedup cache.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// The timeout for establishing a connection to an asset host.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The overall timeout for fetching a single auxiliary asset.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_render_contexts: 5,
            context_acquire_timeout: None,
            max_fetch_concurrency: 5,
            dedup_max_age: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(30),
            logging: Logging::default(),
            metrics: Metrics::default(),
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
    fn test_empty_config() {
        let result = Config::from_reader("".as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.max_render_contexts, 5);
        assert_eq!(cfg.dedup_max_age, Duration::from_secs(1200));
        assert_eq!(cfg.context_acquire_timeout, None);
    }

    #[test]
    fn test_parse_durations() {
        let yaml = r#"
            max_render_contexts: 12
            context_acquire_timeout: 30s
            dedup_max_age: 48h
            sweep_interval: 5m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.max_render_contexts, 12);
        assert_eq!(cfg.context_acquire_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.dedup_max_age, Duration::from_secs(48 * 3600));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(300));
        // unset fields keep their defaults
        assert_eq!(cfg.max_fetch_concurrency, 5);
    }

    #[test]
    fn test_parse_logging_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }
}
