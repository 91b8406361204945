use super::{ByteStream, ObjectStorage};
use crate::model::ObjectDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use shipper_core::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeObject {
    descriptor: ObjectDescriptor,
    data: Bytes,
}

/// In-memory bucket store with fault injection and concurrency tracking.
#[derive(Clone, Default)]
pub struct FakeStorage {
    buckets: Arc<Mutex<HashMap<String, Vec<FakeObject>>>>,
    /// Remaining injected open failures per object name.
    open_failures: Arc<Mutex<HashMap<String, usize>>>,
    failing_buckets: Arc<Mutex<HashMap<String, String>>>,
    open_delay: Arc<Mutex<Option<Duration>>>,
    list_calls: Arc<AtomicUsize>,
    opened: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, name: &str, generation: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let object = FakeObject {
            descriptor: ObjectDescriptor {
                name: name.to_string(),
                size: data.len() as u64,
                generation: generation.to_string(),
                content_type: None,
                last_modified: None,
            },
            data,
        };
        let mut buckets = self.buckets.lock().unwrap();
        let objects = buckets.entry(bucket.to_string()).or_default();
        objects.retain(|o| o.descriptor.name != name);
        objects.push(object);
    }

    pub fn remove(&self, bucket: &str, name: &str) {
        if let Some(objects) = self.buckets.lock().unwrap().get_mut(bucket) {
            objects.retain(|o| o.descriptor.name != name);
        }
    }

    /// The next `times` opens of `name` fail with a transient error.
    pub fn fail_open(&self, name: &str, times: usize) {
        self.open_failures
            .lock()
            .unwrap()
            .insert(name.to_string(), times);
    }

    pub fn fail_listing(&self, bucket: &str, details: &str) {
        self.failing_buckets
            .lock()
            .unwrap()
            .insert(bucket.to_string(), details.to_string());
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Object names in the order their opens were attempted.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn list(&self, bucket: &str) -> Result<Vec<ObjectDescriptor>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(details) = self.failing_buckets.lock().unwrap().get(bucket) {
            return Err(Error::storage(bucket, details.clone()));
        }

        Ok(self
            .buckets
            .lock()
            .unwrap()
            .get(bucket)
            .map(|objects| objects.iter().map(|o| o.descriptor.clone()).collect())
            .unwrap_or_default())
    }

    async fn open(&self, bucket: &str, object: &ObjectDescriptor) -> Result<ByteStream> {
        self.opened.lock().unwrap().push(object.name.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());

        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.open_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&object.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::storage(bucket, format!("503 opening {}", object.name)));
                }
            }
        }

        let data = self
            .buckets
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|objects| objects.iter().find(|o| o.descriptor.name == object.name))
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::storage(bucket, format!("no such key {}", object.name)))?;

        Ok(Box::pin(std::io::Cursor::new(data)))
    }
}
