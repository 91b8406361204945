use crate::metrics::InputMetrics;
use crate::model::{ObjectDescriptor, SourceDescriptor};
use crate::publish::Publisher;
use crate::reader;
use crate::storage::ObjectStorage;
use shipper_core::{retry_with_backoff, Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// One object bound to its source and destination.
#[derive(Clone)]
pub struct WorkItem {
    pub object: ObjectDescriptor,
    pub source: Arc<SourceDescriptor>,
    pub publisher: Arc<dyn Publisher>,
}

/// Downloads, decodes and publishes a single object.
#[derive(Clone)]
pub struct Fetcher {
    storage: Arc<dyn ObjectStorage>,
    metrics: Arc<InputMetrics>,
}

impl Fetcher {
    pub fn new(storage: Arc<dyn ObjectStorage>, metrics: Arc<InputMetrics>) -> Self {
        Self { storage, metrics }
    }

    /// Returns the number of events published. Any publish failure fails the
    /// object so it is never committed with events missing.
    pub async fn fetch_and_publish(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<usize> {
        let source = &item.source;
        let object = &item.object;

        let data = retry_with_backoff(&source.retry, "open_object", cancel, |attempt| {
            if attempt > 1 {
                self.metrics.retried();
            }
            self.read_object(&source.bucket, object)
        })
        .await?;

        self.metrics.bytes(data.len() as u64);

        let events = reader::decode_object(source, object, &data)?;
        let count = events.len();

        for event in events {
            item.publisher.publish(event).await?;
            self.metrics.published(1);
        }

        debug!(
            bucket = %source.bucket,
            object = %object.name,
            events = count,
            bytes = data.len(),
            "Object published"
        );

        Ok(count)
    }

    async fn read_object(&self, bucket: &str, object: &ObjectDescriptor) -> Result<Vec<u8>> {
        let mut stream = self.storage.open(bucket, object).await?;
        let mut data = Vec::with_capacity(object.size.min(64 * 1024 * 1024) as usize);
        stream.read_to_end(&mut data).await.map_err(|e| {
            Error::storage(bucket, format!("failed reading {}: {}", object.name, e))
        })?;
        Ok(data)
    }
}

/// Tally of one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Items that never started or were interrupted by shutdown.
    pub interrupted: usize,
    /// Items still running when the shutdown grace period ran out.
    pub aborted: usize,
    pub cancelled: bool,
}

/// Runs at most `max_workers` fetches at once. Items beyond that wait for a
/// slot, which is the only admission control between discovery and fetching.
#[derive(Clone)]
pub struct WorkerPool {
    fetcher: Fetcher,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<InputMetrics>,
}

struct InFlight {
    counter: Arc<AtomicUsize>,
    metrics: Arc<InputMetrics>,
}

impl InFlight {
    fn enter(counter: Arc<AtomicUsize>, metrics: Arc<InputMetrics>) -> Self {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics.in_flight(n);
        Self { counter, metrics }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let n = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.in_flight(n);
    }
}

impl WorkerPool {
    pub fn new(fetcher: Fetcher, max_workers: usize, metrics: Arc<InputMetrics>) -> Self {
        Self {
            fetcher,
            slots: Arc::new(Semaphore::new(max_workers.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            metrics,
        }
    }

    /// Wait for a slot, then fetch and publish. Nothing starts once `cancel`
    /// has fired.
    pub async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<usize> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.slots.acquire() => {
                permit.map_err(|_| Error::Internal("worker pool closed".into()))?
            }
        };

        let _in_flight = InFlight::enter(self.in_flight.clone(), self.metrics.clone());
        self.fetcher.fetch_and_publish(item, cancel).await
    }

    /// Run a batch to completion, reporting each object as it finishes.
    ///
    /// After cancellation, running fetches get `grace` to finish; whatever is
    /// still running then is aborted and not reported.
    pub async fn run_batch<F>(
        &self,
        items: Vec<WorkItem>,
        cancel: &CancellationToken,
        grace: Duration,
        mut on_complete: F,
    ) -> BatchOutcome
    where
        F: FnMut(&ObjectDescriptor, Result<usize>),
    {
        let mut outcome = BatchOutcome::default();
        let mut tasks = JoinSet::new();

        for item in items {
            let pool = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = pool.process(&item, &cancel).await;
                (item.object, result)
            });
        }

        let mut deadline: Option<Instant> = None;

        loop {
            let joined = match deadline {
                None => tokio::select! {
                    biased;
                    joined = tasks.join_next() => joined,
                    _ = cancel.cancelled() => {
                        debug!(running = tasks.len(), "Shutdown requested, draining worker pool");
                        outcome.cancelled = true;
                        deadline = Some(Instant::now() + grace);
                        continue;
                    }
                },
                Some(at) => match tokio::time::timeout_at(at, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        outcome.aborted = tasks.len();
                        warn!(
                            aborted = outcome.aborted,
                            grace_ms = grace.as_millis() as u64,
                            "Shutdown grace period elapsed, aborting fetches"
                        );
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                        break;
                    }
                },
            };

            match joined {
                None => break,
                Some(Ok((object, result))) => {
                    match &result {
                        Ok(_) => outcome.succeeded += 1,
                        Err(e) if e.is_cancelled() => outcome.interrupted += 1,
                        Err(_) => outcome.failed += 1,
                    }
                    on_complete(&object, result);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Worker task failed");
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }
}
