use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "shipper.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub input: InputConfig,
    pub state: StateConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
}

/// Input-level settings. Every field except `id`, `project_id`, `retry` and
/// `buckets` is a default that a bucket entry may override.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputConfig {
    pub id: String,
    pub project_id: String,
    pub batch_size: usize,
    pub max_workers: usize,
    pub poll: bool,
    pub poll_interval_secs: u64,
    pub parse_json: bool,
    pub timestamp_epoch: Option<i64>,
    pub expand_event_list_from_field: Option<String>,
    #[serde(default)]
    pub file_selectors: Vec<FileSelectorConfig>,
    #[serde(default)]
    pub reader: ReaderConfig,
    pub retry: RetryConfig,
    #[serde(default)]
    pub buckets: Vec<BucketConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BucketConfig {
    pub name: String,
    pub batch_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub poll: Option<bool>,
    pub poll_interval_secs: Option<u64>,
    pub parse_json: Option<bool>,
    pub timestamp_epoch: Option<i64>,
    pub expand_event_list_from_field: Option<String>,
    pub file_selectors: Option<Vec<FileSelectorConfig>>,
    pub reader: Option<ReaderConfig>,
}

/// Fully resolved settings for one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSettings {
    pub name: String,
    pub batch_size: usize,
    pub max_workers: usize,
    pub poll: bool,
    pub poll_interval: Duration,
    pub parse_json: bool,
    pub timestamp_epoch: Option<i64>,
    pub expand_event_list_from_field: Option<String>,
    pub file_selectors: Vec<FileSelectorConfig>,
    pub reader: ReaderConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileSelectorConfig {
    pub regex: String,
    #[serde(default)]
    pub rule: SelectorRule,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorRule {
    #[default]
    Include,
    Exclude,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReaderConfig {
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub split: SplitMode,
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "latin-1", alias = "latin1", alias = "iso-8859-1")]
    Latin1,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    /// One event per non-empty line.
    #[default]
    Lines,
    /// One event per object.
    Whole,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// LZ4 when the object name ends in `.lz4`, plain otherwise.
    #[default]
    Auto,
    None,
    Lz4,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub attempt_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    pub path: String,
    pub max_idle_cycles: Option<u64>,
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub aws_profile: Option<String>,
    pub max_requests_per_second: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    /// Load defaults, then the config file (explicit path or `shipper.toml` when
    /// present), then `SHIPPER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("SHIPPER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Config = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.buckets.is_empty() {
            return Err(ConfigError::Message(
                "input.buckets must contain at least one bucket".into(),
            ));
        }

        let mut seen = HashSet::new();
        for bucket in &self.input.buckets {
            if !seen.insert(bucket.name.as_str()) {
                return Err(ConfigError::Message(format!(
                    "bucket {} is configured more than once",
                    bucket.name
                )));
            }
            self.input.resolve(bucket).validate()?;
        }

        self.input.retry.validate()?;

        if self.state.path.is_empty() {
            return Err(ConfigError::Message("state.path is required".into()));
        }

        if self.state.max_entries == Some(0) {
            return Err(ConfigError::Message(
                "state.max_entries must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl InputConfig {
    /// Apply a bucket's overrides on top of the input-level defaults.
    pub fn resolve(&self, bucket: &BucketConfig) -> BucketSettings {
        BucketSettings {
            name: bucket.name.clone(),
            batch_size: bucket.batch_size.unwrap_or(self.batch_size),
            max_workers: bucket.max_workers.unwrap_or(self.max_workers),
            poll: bucket.poll.unwrap_or(self.poll),
            poll_interval: Duration::from_secs(
                bucket.poll_interval_secs.unwrap_or(self.poll_interval_secs),
            ),
            parse_json: bucket.parse_json.unwrap_or(self.parse_json),
            timestamp_epoch: bucket.timestamp_epoch.or(self.timestamp_epoch),
            expand_event_list_from_field: bucket
                .expand_event_list_from_field
                .clone()
                .or_else(|| self.expand_event_list_from_field.clone()),
            file_selectors: bucket
                .file_selectors
                .clone()
                .unwrap_or_else(|| self.file_selectors.clone()),
            reader: bucket.reader.clone().unwrap_or_else(|| self.reader.clone()),
        }
    }

    pub fn resolved_buckets(&self) -> Vec<BucketSettings> {
        self.buckets.iter().map(|b| self.resolve(b)).collect()
    }
}

impl BucketSettings {
    /// Settings with the built-in defaults, mostly useful for tests and tooling.
    pub fn new(name: impl Into<String>) -> Self {
        let input = Config::default().input;
        input.resolve(&BucketConfig {
            name: name.into(),
            ..BucketConfig::default()
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Message("bucket name is required".into()));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::Message(format!(
                "bucket {}: batch_size must be greater than 0",
                self.name
            )));
        }

        if self.max_workers == 0 {
            return Err(ConfigError::Message(format!(
                "bucket {}: max_workers must be greater than 0",
                self.name
            )));
        }

        if self.poll && self.poll_interval.is_zero() {
            return Err(ConfigError::Message(format!(
                "bucket {}: poll_interval_secs must be greater than 0 when poll is enabled",
                self.name
            )));
        }

        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Message(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Message(
                "retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Message(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }

        if self.attempt_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "retry.attempt_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            attempt_timeout_secs: 120,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: InputConfig {
                id: "bucket-shipper".to_string(),
                project_id: String::new(),
                batch_size: 100,
                max_workers: 5,
                poll: true,
                poll_interval_secs: 300,
                parse_json: false,
                timestamp_epoch: None,
                expand_event_list_from_field: None,
                file_selectors: Vec::new(),
                reader: ReaderConfig::default(),
                retry: RetryConfig::default(),
                buckets: Vec::new(),
            },
            state: StateConfig {
                path: "data/cursor_state.json".to_string(),
                max_idle_cycles: Some(10),
                max_entries: None,
            },
            storage: StorageConfig {
                region: "us-east-1".to_string(),
                endpoint: None,
                aws_profile: None,
                max_requests_per_second: None,
            },
            scheduler: SchedulerConfig {
                shutdown_grace_secs: 30,
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
                metrics_enabled: true,
                metrics_port: 9090,
            },
        }
    }
}
