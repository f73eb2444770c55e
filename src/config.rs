//! Engine configuration, loadable from TOML.
//!
//! Every key is optional; a missing key takes its default. Durations are written
//! as integer milliseconds under a `*_ms` key:
//!
//! ```toml
//! max_concurrent_requests = 16
//! max_requests_per_host = 2
//! download_delay_ms = 500
//! idle_timeout_ms = 60000
//! ```

use crate::error::SpiderError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Size of the global dispatcher pool and of the admission window.
    pub max_concurrent_requests: usize,
    /// Concurrent exchanges allowed against one host.
    pub max_requests_per_host: usize,
    /// Minimum gap between consecutive dispatches to one host.
    #[serde(rename = "download_delay_ms", with = "millis")]
    pub download_delay: Duration,
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout of the default downloader.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// How long a fetcher may sit without work before it removes itself.
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout: Duration,
    pub max_concurrent_items: usize,
    /// Admission wait used by the queue feed and `start_urls`.
    #[serde(rename = "submit_timeout_ms", with = "millis")]
    pub submit_timeout: Duration,
    #[serde(rename = "resize_interval_ms", with = "millis")]
    pub resize_interval: Duration,
    #[serde(rename = "queue_poll_interval_ms", with = "millis")]
    pub queue_poll_interval: Duration,
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,
    pub user_agent: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: num_cpus::get().saturating_mul(3).max(1),
            max_requests_per_host: 1,
            download_delay: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10 * 60),
            max_concurrent_items: num_cpus::get().clamp(1, 8),
            submit_timeout: Duration::from_secs(5),
            resize_interval: Duration::from_secs(5),
            queue_poll_interval: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(30),
            user_agent: "spider-engine".to_string(),
        }
    }
}

impl CrawlerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, SpiderError> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> Result<String, SpiderError> {
        toml::to_string_pretty(self).map_err(|e| SpiderError::GeneralError(e.to_string()))
    }

    /// Reads and validates a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg = Self::from_toml_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("validating config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SpiderError> {
        let nonzero = [
            ("max_concurrent_requests", self.max_concurrent_requests),
            ("max_requests_per_host", self.max_requests_per_host),
            ("max_concurrent_items", self.max_concurrent_items),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(SpiderError::ConfigurationError(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        let durations = [
            ("request_timeout", self.request_timeout),
            ("connect_timeout", self.connect_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
            ("idle_timeout", self.idle_timeout),
            ("resize_interval", self.resize_interval),
            ("queue_poll_interval", self.queue_poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(SpiderError::ConfigurationError(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if reqwest::header::HeaderValue::from_str(&self.user_agent).is_err() {
            return Err(SpiderError::ConfigurationError(format!(
                "user_agent {:?} is not a valid header value",
                self.user_agent
            )));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let cfg = CrawlerConfig::default();
        assert!(cfg.max_concurrent_requests >= 3);
        assert_eq!(cfg.max_requests_per_host, 1);
        assert_eq!(cfg.download_delay, Duration::from_millis(200));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(600));
        assert!((1..=8).contains(&cfg.max_concurrent_items));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = CrawlerConfig::from_toml_str(
            r#"
            max_requests_per_host = 4
            download_delay_ms = 1500
            user_agent = "test-bot/1.0"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_requests_per_host, 4);
        assert_eq!(cfg.download_delay, Duration::from_millis(1500));
        assert_eq!(cfg.user_agent, "test-bot/1.0");
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = CrawlerConfig {
            idle_timeout: Duration::from_millis(750),
            ..CrawlerConfig::default()
        };
        let text = cfg.to_toml_string().unwrap();
        assert!(text.contains("idle_timeout_ms = 750"));
        assert_eq!(CrawlerConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn zero_caps_and_intervals_are_rejected() {
        let cases = [
            CrawlerConfig { max_concurrent_requests: 0, ..Default::default() },
            CrawlerConfig { max_requests_per_host: 0, ..Default::default() },
            CrawlerConfig { max_concurrent_items: 0, ..Default::default() },
            CrawlerConfig { idle_timeout: Duration::ZERO, ..Default::default() },
            CrawlerConfig { resize_interval: Duration::ZERO, ..Default::default() },
            CrawlerConfig { queue_poll_interval: Duration::ZERO, ..Default::default() },
            CrawlerConfig { request_timeout: Duration::ZERO, ..Default::default() },
            CrawlerConfig { connect_timeout: Duration::ZERO, ..Default::default() },
            CrawlerConfig { shutdown_timeout: Duration::ZERO, ..Default::default() },
        ];
        for cfg in cases {
            assert!(matches!(cfg.validate(), Err(SpiderError::ConfigurationError(_))));
        }
    }

    #[test]
    fn load_reads_and_validates_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_items = 2\nqueue_poll_interval_ms = 50").unwrap();
        let cfg = CrawlerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.max_concurrent_items, 2);
        assert_eq!(cfg.queue_poll_interval, Duration::from_millis(50));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "max_requests_per_host = 0").unwrap();
        let err = CrawlerConfig::load(bad.path()).unwrap_err();
        assert!(format!("{err:#}").contains("max_requests_per_host"));
    }
}
