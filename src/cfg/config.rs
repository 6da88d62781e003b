// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Top-level engine configuration, assembled from the four tables the core
/// recognizes (`downloader`, `scheduler`, `spider`, `parser`).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub spider: SpiderConfig,
    #[serde(default)]
    pub parser: ParserConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DownloaderConfig {
    /// Global fetch parallelism (>= 1).
    pub concurrency: usize,
    /// Per-request timeout, seconds.
    #[serde(with = "serde_secs")]
    pub request_timeout: Duration,
    /// Base delay for the backoff formula, seconds.
    #[serde(with = "serde_secs")]
    pub retry_delay: Duration,
    pub follow_redirects: bool,
    pub user_agent: String,
    /// Maximum redirect hops before treating the request as redirect-overflow.
    pub max_redirects: u8,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            request_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(500),
            follow_redirects: true,
            user_agent: "webants/0.1".to_string(),
            max_redirects: 20,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct SchedulerConfig {
    /// 0 = unlimited.
    pub max_requests: u64,
    /// Global inter-dispatch delay, seconds.
    #[serde(with = "serde_secs")]
    pub request_delay: Duration,
    /// Floor for per-host spacing, seconds.
    #[serde(with = "serde_secs")]
    pub domain_delay: Duration,
    pub max_domain_concurrent: usize,
    pub max_queue_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_requests: 0,
            request_delay: Duration::ZERO,
            domain_delay: Duration::from_millis(200),
            max_domain_concurrent: 4,
            max_queue_size: 10_000,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct SpiderConfig {
    /// Circuit opens after this many consecutive terminal failures on a host.
    pub failure_threshold: u32,
    /// Seconds until an open circuit moves to half-open.
    #[serde(with = "serde_secs")]
    pub recovery_timeout: Duration,
    /// How often the driver sweeps the failed-URL set for retry, seconds.
    #[serde(with = "serde_secs")]
    pub retry_sweep_interval: Duration,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            retry_sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ParserConfig {
    /// Byte cap on a fetched document before it is treated as oversized.
    pub max_document_size: u64,
    pub default_encoding: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_document_size: 10 * 1024 * 1024,
            default_encoding: "utf-8".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            downloader: DownloaderConfig::default(),
            scheduler: SchedulerConfig::default(),
            spider: SpiderConfig::default(),
            parser: ParserConfig::default(),
        }
    }
}

/// Extra custom/vendor knobs that do not map to a recognized key, kept around
/// the same way the wire-protocol extensions table did: surfaced but not
/// interpreted by the core.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Extensions {
    #[serde(flatten)]
    pub custom: HashMap<String, String>,
}

impl Config {
    /// Loads the configuration from YAML, applies `WEBANTS_`-prefixed
    /// environment overrides, validates it, and returns the ready-to-use
    /// value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file: {}", path.as_ref().display())
        })?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.apply_env_overrides().context("failed to apply WEBANTS_ env overrides")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Overlays environment variables of the form
    /// `WEBANTS_<TABLE>__<FIELD>` (e.g. `WEBANTS_DOWNLOADER__CONCURRENCY=32`)
    /// on top of the file-loaded config.
    fn apply_env_overrides(&mut self) -> Result<()> {
        for (key, value) in env::vars() {
            let Some(rest) = key.strip_prefix("WEBANTS_") else {
                continue;
            };
            let Some((table, field)) = rest.split_once("__") else {
                continue;
            };
            self.apply_one_override(table, field, &value)
                .with_context(|| format!("invalid override {key}={value}"))?;
        }
        Ok(())
    }

    fn apply_one_override(&mut self, table: &str, field: &str, value: &str) -> Result<()> {
        match table.to_ascii_lowercase().as_str() {
            "downloader" => match field.to_ascii_lowercase().as_str() {
                "concurrency" => self.downloader.concurrency = value.parse()?,
                "request_timeout" => {
                    self.downloader.request_timeout = Duration::from_secs(value.parse()?)
                },
                "retry_delay" => {
                    self.downloader.retry_delay = Duration::from_secs(value.parse()?)
                },
                "follow_redirects" => self.downloader.follow_redirects = value.parse()?,
                "user_agent" => self.downloader.user_agent = value.to_string(),
                "max_redirects" => self.downloader.max_redirects = value.parse()?,
                _ => {},
            },
            "scheduler" => match field.to_ascii_lowercase().as_str() {
                "max_requests" => self.scheduler.max_requests = value.parse()?,
                "request_delay" => {
                    self.scheduler.request_delay = Duration::from_secs(value.parse()?)
                },
                "domain_delay" => {
                    self.scheduler.domain_delay = Duration::from_secs(value.parse()?)
                },
                "max_domain_concurrent" => {
                    self.scheduler.max_domain_concurrent = value.parse()?
                },
                "max_queue_size" => self.scheduler.max_queue_size = value.parse()?,
                _ => {},
            },
            "spider" => match field.to_ascii_lowercase().as_str() {
                "failure_threshold" => self.spider.failure_threshold = value.parse()?,
                "recovery_timeout" => {
                    self.spider.recovery_timeout = Duration::from_secs(value.parse()?)
                },
                "retry_sweep_interval" => {
                    self.spider.retry_sweep_interval = Duration::from_secs(value.parse()?)
                },
                _ => {},
            },
            "parser" => match field.to_ascii_lowercase().as_str() {
                "max_document_size" => self.parser.max_document_size = value.parse()?,
                "default_encoding" => self.parser.default_encoding = value.to_string(),
                _ => {},
            },
            _ => {},
        }
        Ok(())
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.downloader.concurrency >= 1,
            "downloader.concurrency must be >= 1"
        );
        ensure!(
            !self.downloader.request_timeout.is_zero(),
            "downloader.request_timeout must be > 0"
        );
        ensure!(
            self.scheduler.max_domain_concurrent >= 1,
            "scheduler.max_domain_concurrent must be >= 1"
        );
        ensure!(
            self.scheduler.max_queue_size >= 1,
            "scheduler.max_queue_size must be >= 1"
        );
        ensure!(
            self.spider.failure_threshold >= 1,
            "spider.failure_threshold must be >= 1"
        );
        ensure!(
            !self.spider.recovery_timeout.is_zero(),
            "spider.recovery_timeout must be > 0"
        );
        ensure!(
            self.parser.max_document_size >= 1,
            "parser.max_document_size must be >= 1"
        );

        if self.downloader.user_agent.trim().is_empty() {
            self.downloader.user_agent = DownloaderConfig::default().user_agent;
        }

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let mut cfg = Config::default();
        cfg.validate_and_normalize().expect("defaults must validate");
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut cfg = Config::default();
        cfg.downloader.concurrency = 0;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn blank_user_agent_is_normalized() {
        let mut cfg = Config::default();
        cfg.downloader.user_agent = "  ".to_string();
        cfg.validate_and_normalize().unwrap();
        assert_eq!(cfg.downloader.user_agent, DownloaderConfig::default().user_agent);
    }

    #[test]
    fn env_override_changes_concurrency() {
        let mut cfg = Config::default();
        // SAFETY: test runs single-threaded w.r.t. this var; no other test
        // reads WEBANTS_DOWNLOADER__CONCURRENCY concurrently.
        unsafe {
            env::set_var("WEBANTS_DOWNLOADER__CONCURRENCY", "7");
        }
        cfg.apply_env_overrides().unwrap();
        unsafe {
            env::remove_var("WEBANTS_DOWNLOADER__CONCURRENCY");
        }
        assert_eq!(cfg.downloader.concurrency, 7);
    }
}
