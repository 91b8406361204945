use crate::selector::ObjectSelector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipper_core::config::{BucketSettings, ReaderConfig, RetryConfig};
use shipper_core::{Error, Result, RetryPolicy};
use std::fmt;
use std::time::Duration;

/// Identity of one object version: a new generation of the same name is a new object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub name: String,
    pub generation: String,
}

impl ObjectId {
    pub fn new(name: impl Into<String>, generation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: generation.into(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub name: String,
    pub size: u64,
    pub generation: String,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectDescriptor {
    pub fn id(&self) -> ObjectId {
        ObjectId::new(self.name.clone(), self.generation.clone())
    }
}

/// Immutable per-bucket settings with selectors compiled and retry resolved.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub project_id: String,
    pub bucket: String,
    pub batch_size: usize,
    pub max_workers: usize,
    pub poll: bool,
    pub poll_interval: Duration,
    pub parse_json: bool,
    pub timestamp_epoch: Option<i64>,
    pub expand_event_list_from_field: Option<String>,
    pub selector: ObjectSelector,
    pub reader: ReaderConfig,
    pub retry: RetryPolicy,
}

impl SourceDescriptor {
    pub fn new(project_id: &str, settings: &BucketSettings, retry: &RetryConfig) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        retry.validate().map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            project_id: project_id.to_string(),
            bucket: settings.name.clone(),
            batch_size: settings.batch_size,
            max_workers: settings.max_workers,
            poll: settings.poll,
            poll_interval: settings.poll_interval,
            parse_json: settings.parse_json,
            timestamp_epoch: settings.timestamp_epoch,
            expand_event_list_from_field: settings.expand_event_list_from_field.clone(),
            selector: ObjectSelector::new(&settings.file_selectors)?,
            reader: settings.reader.clone(),
            retry: RetryPolicy::from_config(retry),
        })
    }

    pub fn url(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectRef {
    pub name: String,
    pub generation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// One published record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// `<bucket>/<object>#<generation>-<offset>`, stable across re-deliveries.
    pub id: String,
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    pub project_id: String,
    pub bucket: String,
    pub object: ObjectRef,
    pub offset: u64,
}
