//! Typed pipeline configuration.
//!
//! Three sources, all optional: built-in defaults, a TOML file, and
//! `STAGEPIPE_*` environment variables. Durations are given in
//! milliseconds. Malformed values fail fast with [`Error::Config`].

use crate::engine::PipelineConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Work items used when none are supplied.
pub const SAMPLE_ITEMS: &[&str] = &[
    "sunset.jpg",
    "harbor.png",
    "portrait.jpg",
    "skyline.webp",
    "forest.jpg",
    "glacier.png",
    "market.jpg",
    "lighthouse.png",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub items: Vec<String>,
    pub transform_workers: usize,
    pub persist_workers: usize,
    pub transform_queue_capacity: usize,
    pub persist_queue_capacity: usize,
    pub outcome_queue_capacity: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_jitter_max: Duration,
    /// Wall-clock limit after which cancellation fires. `None` = no limit.
    pub run_deadline: Option<Duration>,
    pub metrics_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let transform_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers(transform_workers, transform_workers * 2)
    }
}

/// File form of [`Config`]. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    items: Option<Vec<String>>,
    transform_workers: Option<usize>,
    persist_workers: Option<usize>,
    transform_queue_capacity: Option<usize>,
    persist_queue_capacity: Option<usize>,
    outcome_queue_capacity: Option<usize>,
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_jitter_max_ms: Option<u64>,
    run_deadline_ms: Option<u64>,
    metrics_interval_ms: Option<u64>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Defaults for the given pool sizes; queue capacities are twice the
    /// size of the pool that consumes them.
    pub fn with_workers(transform_workers: usize, persist_workers: usize) -> Self {
        Self {
            items: SAMPLE_ITEMS.iter().map(|s| s.to_string()).collect(),
            transform_workers,
            persist_workers,
            transform_queue_capacity: transform_workers * 2,
            persist_queue_capacity: persist_workers * 2,
            outcome_queue_capacity: persist_workers * 2,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_jitter_max: Duration::from_millis(50),
            run_deadline: None,
            metrics_interval: Duration::from_secs(1),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables over the defaults.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file over the defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))
    }

    /// Parse TOML text over the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let mut config = Self::default();
        config.apply_file(file);
        config.validate()?;
        Ok(config)
    }

    /// Overlay `STAGEPIPE_*` environment variables onto `self`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(items) = optional_var("STAGEPIPE_ITEMS") {
            self.items = split_items(&items);
        }
        let transform_workers = parsed_var::<usize>("STAGEPIPE_TRANSFORM_WORKERS")?;
        let persist_workers = parsed_var::<usize>("STAGEPIPE_PERSIST_WORKERS")?;
        self.set_workers(transform_workers, persist_workers);

        if let Some(n) = parsed_var("STAGEPIPE_TRANSFORM_QUEUE_CAPACITY")? {
            self.transform_queue_capacity = n;
        }
        if let Some(n) = parsed_var("STAGEPIPE_PERSIST_QUEUE_CAPACITY")? {
            self.persist_queue_capacity = n;
        }
        if let Some(n) = parsed_var("STAGEPIPE_OUTCOME_QUEUE_CAPACITY")? {
            self.outcome_queue_capacity = n;
        }
        if let Some(n) = parsed_var("STAGEPIPE_RETRY_MAX_ATTEMPTS")? {
            self.retry_max_attempts = n;
        }
        if let Some(ms) = parsed_var("STAGEPIPE_RETRY_BASE_DELAY_MS")? {
            self.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed_var("STAGEPIPE_RETRY_JITTER_MAX_MS")? {
            self.retry_jitter_max = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed_var("STAGEPIPE_RUN_DEADLINE_MS")? {
            self.run_deadline = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parsed_var("STAGEPIPE_METRICS_INTERVAL_MS")? {
            self.metrics_interval = Duration::from_millis(ms);
        }
        if let Some(endpoint) = optional_var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(endpoint);
        }
        if let Some(level) = optional_var("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(items) = file.items {
            self.items = items;
        }
        self.set_workers(file.transform_workers, file.persist_workers);
        if let Some(n) = file.transform_queue_capacity {
            self.transform_queue_capacity = n;
        }
        if let Some(n) = file.persist_queue_capacity {
            self.persist_queue_capacity = n;
        }
        if let Some(n) = file.outcome_queue_capacity {
            self.outcome_queue_capacity = n;
        }
        if let Some(n) = file.retry_max_attempts {
            self.retry_max_attempts = n;
        }
        if let Some(ms) = file.retry_base_delay_ms {
            self.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.retry_jitter_max_ms {
            self.retry_jitter_max = Duration::from_millis(ms);
        }
        if let Some(ms) = file.run_deadline_ms {
            self.run_deadline = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = file.metrics_interval_ms {
            self.metrics_interval = Duration::from_millis(ms);
        }
        if file.otel_endpoint.is_some() {
            self.otel_endpoint = file.otel_endpoint;
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
    }

    /// Change pool sizes, re-deriving the queue capacities from them. An
    /// explicit capacity must be set after this call to stick.
    pub fn set_workers(&mut self, transform_workers: Option<usize>, persist_workers: Option<usize>) {
        if let Some(n) = transform_workers {
            self.transform_workers = n;
            self.transform_queue_capacity = n * 2;
            if persist_workers.is_none() {
                self.persist_workers = n * 2;
            }
        }
        if let Some(n) = persist_workers {
            self.persist_workers = n;
        }
        if transform_workers.is_some() || persist_workers.is_some() {
            self.persist_queue_capacity = self.persist_workers * 2;
            self.outcome_queue_capacity = self.persist_workers * 2;
        }
    }

    /// Reject values that would stall or disable the pipeline.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, usize); 5] = [
            ("transform_workers", self.transform_workers),
            ("persist_workers", self.persist_workers),
            ("transform_queue_capacity", self.transform_queue_capacity),
            ("persist_queue_capacity", self.persist_queue_capacity),
            ("outcome_queue_capacity", self.outcome_queue_capacity),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be at least 1")));
            }
        }
        if self.retry_max_attempts == 0 {
            return Err(Error::Config(
                "retry_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.metrics_interval.is_zero() {
            return Err(Error::Config(
                "metrics_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            self.retry_base_delay,
            self.retry_jitter_max,
        )
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            transform_workers: self.transform_workers,
            persist_workers: self.persist_workers,
            transform_queue_capacity: self.transform_queue_capacity,
            persist_queue_capacity: self.persist_queue_capacity,
            outcome_queue_capacity: self.outcome_queue_capacity,
            retry: self.retry_policy(),
            run_deadline: self.run_deadline,
            metrics_interval: self.metrics_interval,
        }
    }
}

/// Split a comma-separated item list, ignoring blanks.
pub fn split_items(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("environment variable {name}={raw:?}: {e}")))
        })
        .transpose()
}
