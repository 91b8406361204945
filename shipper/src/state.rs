//! Cursor state: which objects of each bucket are done, persisted to a JSON file.
//!
//! The file maps bucket name to a [`BucketSnapshot`]. Unknown fields are ignored
//! on load and a missing or unreadable file yields empty state, so a damaged
//! file costs a re-scan rather than a crash.

use crate::model::{ObjectDescriptor, ObjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipper_core::config::StateConfig;
use shipper_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneRecord {
    #[serde(flatten)]
    pub id: ObjectId,
    pub marked_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen_cycle: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    #[serde(default)]
    pub done: Vec<DoneRecord>,
    #[serde(default)]
    pub current_source: Option<String>,
    #[serde(default)]
    pub last_scan: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cycle: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFileContents {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    buckets: BTreeMap<String, BucketSnapshot>,
}

/// Bounds on the done set. Entries for objects still present in the bucket are
/// refreshed every cycle, so `max_idle_cycles` only drops objects that have
/// disappeared from the listing.
///
/// `max_entries` is a hard cap. Set it below the number of objects a bucket
/// keeps around and the surplus is evicted while still listed, so those objects
/// are fetched and published again on the next cycle, every cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_idle_cycles: Option<u64>,
    pub max_entries: Option<usize>,
}

impl RetentionPolicy {
    pub fn from_config(config: &StateConfig) -> Self {
        Self {
            max_idle_cycles: config.max_idle_cycles,
            max_entries: config.max_entries,
        }
    }
}

/// Result of one [`CursorState::evict`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eviction {
    pub dropped: usize,
    /// Dropped entries whose object was in the current cycle's listing. These
    /// will be re-published.
    pub still_listed: usize,
}

#[derive(Debug, Clone, Copy)]
struct DoneEntry {
    marked_at: DateTime<Utc>,
    last_seen_cycle: u64,
}

#[derive(Debug, Default)]
struct CursorInner {
    done: HashMap<ObjectId, DoneEntry>,
    current_source: Option<String>,
    last_scan: Option<DateTime<Utc>>,
    cycle: u64,
}

/// Progress of one bucket. Cloning shares the same state; every mutation is
/// serialized by an internal lock.
#[derive(Debug, Clone)]
pub struct CursorState {
    bucket: String,
    inner: Arc<Mutex<CursorInner>>,
}

impl CursorState {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self::from_snapshot(bucket, BucketSnapshot::default())
    }

    pub fn from_snapshot(bucket: impl Into<String>, snapshot: BucketSnapshot) -> Self {
        let done = snapshot
            .done
            .into_iter()
            .map(|r| {
                (
                    r.id,
                    DoneEntry {
                        marked_at: r.marked_at,
                        last_seen_cycle: r.last_seen_cycle,
                    },
                )
            })
            .collect();

        Self {
            bucket: bucket.into(),
            inner: Arc::new(Mutex::new(CursorInner {
                done,
                current_source: snapshot.current_source,
                last_scan: snapshot.last_scan,
                cycle: snapshot.cycle,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CursorInner> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn is_done(&self, id: &ObjectId) -> bool {
        self.lock().done.contains_key(id)
    }

    /// Record `id` as processed. Returns `true` only for the call that inserted
    /// it; marking an already-done object changes nothing.
    pub fn mark_done(&self, id: &ObjectId) -> bool {
        let mut inner = self.lock();
        let cycle = inner.cycle;
        if inner.done.contains_key(id) {
            return false;
        }
        inner.done.insert(
            id.clone(),
            DoneEntry {
                marked_at: Utc::now(),
                last_seen_cycle: cycle,
            },
        );
        true
    }

    /// Start a listing cycle and return its number.
    pub fn begin_cycle(&self) -> u64 {
        let mut inner = self.lock();
        inner.cycle += 1;
        inner.current_source = Some(self.bucket.clone());
        inner.cycle
    }

    /// Split a listing into objects still to process and the count already done,
    /// refreshing the done entries seen in this listing.
    pub fn pending(&self, listed: Vec<ObjectDescriptor>) -> (Vec<ObjectDescriptor>, usize) {
        let mut inner = self.lock();
        let cycle = inner.cycle;
        let mut already_done = 0;

        let pending = listed
            .into_iter()
            .filter(|o| match inner.done.get_mut(&o.id()) {
                Some(entry) => {
                    entry.last_seen_cycle = cycle;
                    already_done += 1;
                    false
                }
                None => true,
            })
            .collect();

        (pending, already_done)
    }

    pub fn finish_cycle(&self, at: DateTime<Utc>) {
        self.lock().last_scan = Some(at);
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        self.lock().last_scan
    }

    /// Apply the retention policy.
    pub fn evict(&self, policy: &RetentionPolicy) -> Eviction {
        let mut inner = self.lock();
        let before = inner.done.len();
        let cycle = inner.cycle;
        let mut still_listed = 0;

        if let Some(max_idle) = policy.max_idle_cycles {
            inner
                .done
                .retain(|_, e| cycle.saturating_sub(e.last_seen_cycle) <= max_idle);
        }

        if let Some(max_entries) = policy.max_entries {
            let excess = inner.done.len().saturating_sub(max_entries);
            if excess > 0 {
                let mut oldest: Vec<(ObjectId, DoneEntry)> =
                    inner.done.iter().map(|(k, v)| (k.clone(), *v)).collect();
                oldest.sort_by_key(|(_, e)| (e.last_seen_cycle, e.marked_at));
                for (id, entry) in oldest.into_iter().take(excess) {
                    if entry.last_seen_cycle == cycle {
                        still_listed += 1;
                    }
                    inner.done.remove(&id);
                }
            }

            if still_listed > 0 {
                warn!(
                    bucket = %self.bucket,
                    max_entries,
                    still_listed,
                    "Cursor cap evicted objects that are still listed; they will be published again"
                );
            }
        }

        Eviction {
            dropped: before - inner.done.len(),
            still_listed,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let inner = self.lock();
        let mut done: Vec<DoneRecord> = inner
            .done
            .iter()
            .map(|(id, e)| DoneRecord {
                id: id.clone(),
                marked_at: e.marked_at,
                last_seen_cycle: e.last_seen_cycle,
            })
            .collect();
        done.sort_by(|a, b| a.id.cmp(&b.id));

        BucketSnapshot {
            done,
            current_source: inner.current_source.clone(),
            last_scan: inner.last_scan,
            cycle: inner.cycle,
        }
    }
}

/// The on-disk home of every bucket's snapshot. Writes are serialized and
/// atomic (temp file + rename).
pub struct StateFile {
    path: PathBuf,
    contents: tokio::sync::Mutex<StateFileContents>,
}

impl StateFile {
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StateFileContents>(&bytes) {
                Ok(contents) => {
                    info!(
                        path = %path.display(),
                        buckets = contents.buckets.len(),
                        "Loaded cursor state"
                    );
                    contents
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Cursor state file is unreadable, starting from empty state"
                    );
                    StateFileContents::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No cursor state file, starting fresh");
                StateFileContents::default()
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read cursor state file, starting from empty state"
                );
                StateFileContents::default()
            }
        };

        Self {
            path,
            contents: tokio::sync::Mutex::new(contents),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cursor for `bucket`, restored from the file when present.
    pub async fn cursor(&self, bucket: &str) -> CursorState {
        let snapshot = self
            .contents
            .lock()
            .await
            .buckets
            .get(bucket)
            .cloned()
            .unwrap_or_default();
        CursorState::from_snapshot(bucket, snapshot)
    }

    pub async fn snapshots(&self) -> BTreeMap<String, BucketSnapshot> {
        self.contents.lock().await.buckets.clone()
    }

    pub async fn save(&self, bucket: &str, snapshot: BucketSnapshot) -> Result<()> {
        let mut contents = self.contents.lock().await;
        contents.version = STATE_VERSION;
        contents.buckets.insert(bucket.to_string(), snapshot);

        let bytes = serde_json::to_vec_pretty(&*contents)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        // The temp file is durable before it replaces the real path.
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            Error::State(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!(bucket, path = %self.path.display(), "Cursor state saved");
        Ok(())
    }
}
