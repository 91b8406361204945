use crate::fetcher::{Fetcher, WorkItem, WorkerPool};
use crate::metrics::InputMetrics;
use crate::model::{ObjectDescriptor, SourceDescriptor};
use crate::publish::Publisher;
use crate::state::{CursorState, RetentionPolicy, StateFile};
use crate::status::{NoopStatusReporter, Status, StatusReporter};
use crate::storage::ObjectStorage;
use chrono::Utc;
use shipper_core::config::InputConfig;
use shipper_core::{retry_with_backoff, Error, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Collaborators shared by every bucket of one input.
#[derive(Clone)]
pub struct SchedulerContext {
    pub input_id: String,
    pub storage: Arc<dyn ObjectStorage>,
    pub publisher: Arc<dyn Publisher>,
    pub status: Arc<dyn StatusReporter>,
    pub state: Arc<StateFile>,
    pub retention: RetentionPolicy,
    pub shutdown_grace: Duration,
}

impl SchedulerContext {
    /// Status updates are discarded and nothing is evicted until overridden.
    pub fn new(
        input_id: impl Into<String>,
        storage: Arc<dyn ObjectStorage>,
        publisher: Arc<dyn Publisher>,
        state: Arc<StateFile>,
    ) -> Self {
        Self {
            input_id: input_id.into(),
            storage,
            publisher,
            status: Arc::new(NoopStatusReporter),
            state,
            retention: RetentionPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub cycle: u64,
    pub listed: usize,
    pub already_done: usize,
    pub selected: usize,
    pub processed: usize,
    pub failed: usize,
    pub events: usize,
    pub evicted: usize,
}

/// Drives one bucket: list, filter against the cursor and selector, dispatch in
/// batches, commit each object as it completes.
pub struct Scheduler {
    source: Arc<SourceDescriptor>,
    storage: Arc<dyn ObjectStorage>,
    publisher: Arc<dyn Publisher>,
    status: Arc<dyn StatusReporter>,
    state: Arc<StateFile>,
    retention: RetentionPolicy,
    shutdown_grace: Duration,
    cursor: CursorState,
    metrics: Arc<InputMetrics>,
    pool: WorkerPool,
    last_status: Mutex<Option<Status>>,
}

impl Scheduler {
    pub async fn new(source: SourceDescriptor, ctx: &SchedulerContext) -> Self {
        let metrics = Arc::new(InputMetrics::new(
            format!("{}:{}", ctx.input_id, source.bucket),
            source.url(),
        ));
        let cursor = ctx.state.cursor(&source.bucket).await;
        metrics.cursor_entries(cursor.len());

        let pool = WorkerPool::new(
            Fetcher::new(ctx.storage.clone(), metrics.clone()),
            source.max_workers,
            metrics.clone(),
        );

        Self {
            source: Arc::new(source),
            storage: ctx.storage.clone(),
            publisher: ctx.publisher.clone(),
            status: ctx.status.clone(),
            state: ctx.state.clone(),
            retention: ctx.retention,
            shutdown_grace: ctx.shutdown_grace,
            cursor,
            metrics,
            pool,
            last_status: Mutex::new(None),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.source.bucket
    }

    pub fn cursor(&self) -> &CursorState {
        &self.cursor
    }

    pub fn metrics(&self) -> &InputMetrics {
        &self.metrics
    }

    /// Run until the bucket is drained (stateless) or `cancel` fires (polling).
    ///
    /// Returns `Error::Cancelled` when stopped by `cancel`, and any bucket-level
    /// failure such as an exhausted listing retry. Object-level failures never
    /// end the loop.
    #[instrument(skip_all, fields(bucket = %self.source.bucket))]
    pub async fn schedule(&self, cancel: CancellationToken) -> Result<()> {
        self.report(Status::Starting, "");
        self.report(Status::Configuring, &self.source.url());

        info!(
            project_id = %self.source.project_id,
            poll = self.source.poll,
            poll_interval_secs = self.source.poll_interval.as_secs(),
            batch_size = self.source.batch_size,
            max_workers = self.source.max_workers,
            done = self.cursor.len(),
            last_scan = ?self.cursor.last_scan(),
            "Starting bucket input"
        );

        let result = self.poll_loop(&cancel).await;

        match &result {
            Ok(()) => self.report(Status::Stopping, "input finished"),
            Err(e) if e.is_cancelled() => self.report(Status::Stopping, "shutdown requested"),
            Err(e) => self.report(Status::Failed, &e.to_string()),
        }
        self.metrics.close();

        result
    }

    async fn poll_loop(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let summary = self.run_cycle(cancel).await?;

            if summary.failed > 0 {
                self.report(
                    Status::Degraded,
                    &format!("{} objects failed in cycle {}", summary.failed, summary.cycle),
                );
            } else {
                self.report(Status::Running, "");
            }

            if !self.source.poll {
                return Ok(());
            }

            debug!(
                sleep_secs = self.source.poll_interval.as_secs(),
                "Waiting for next listing"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.source.poll_interval) => {}
            }
        }
    }

    /// One listing plus the dispatch of everything it surfaced.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary> {
        let cycle = self.cursor.begin_cycle();
        let bucket = self.source.bucket.as_str();

        let listed = retry_with_backoff(&self.source.retry, "list_objects", cancel, |attempt| {
            if attempt > 1 {
                self.metrics.retried();
            }
            self.storage.list(bucket)
        })
        .await?;

        let mut summary = CycleSummary {
            cycle,
            listed: listed.len(),
            ..CycleSummary::default()
        };
        self.metrics.discovered(listed.len() as u64);

        if self.current_status() == Some(Status::Configuring) {
            self.report(Status::Running, "first listing succeeded");
        }

        let (pending, already_done) = self.cursor.pending(listed);
        let pending_count = pending.len();
        let selected = self.source.selector.select(pending);

        summary.already_done = already_done;
        summary.selected = selected.len();
        self.metrics
            .skipped((already_done + pending_count - selected.len()) as u64);

        if selected.is_empty() {
            self.metrics.no_new_objects();
            debug!(cycle, listed = summary.listed, "No new objects");
        }

        let mut cancelled = false;
        for batch in selected.chunks(self.source.batch_size) {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let items = batch
                .iter()
                .cloned()
                .map(|object| WorkItem {
                    object,
                    source: self.source.clone(),
                    publisher: self.publisher.clone(),
                })
                .collect();

            let outcome = self
                .pool
                .run_batch(items, cancel, self.shutdown_grace, |object, result| {
                    self.complete(object, result, &mut summary)
                })
                .await;

            self.persist().await;

            if outcome.cancelled {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            info!(
                cycle,
                processed = summary.processed,
                "Cycle interrupted by shutdown"
            );
            return Err(Error::Cancelled);
        }

        self.cursor.finish_cycle(Utc::now());
        summary.evicted = self.cursor.evict(&self.retention).dropped;
        if summary.evicted > 0 {
            self.metrics.evicted(summary.evicted as u64);
        }
        self.metrics.cursor_entries(self.cursor.len());
        self.persist().await;

        info!(
            cycle,
            listed = summary.listed,
            selected = summary.selected,
            processed = summary.processed,
            failed = summary.failed,
            events = summary.events,
            "Cycle complete"
        );

        Ok(summary)
    }

    fn complete(&self, object: &ObjectDescriptor, result: Result<usize>, summary: &mut CycleSummary) {
        match result {
            Ok(events) => {
                if self.cursor.mark_done(&object.id()) {
                    self.metrics.processed();
                }
                summary.processed += 1;
                summary.events += events;
            }
            Err(e) if e.is_cancelled() => {
                debug!(object = %object.name, "Object interrupted by shutdown");
            }
            Err(e) => {
                summary.failed += 1;
                self.metrics.object_error();
                warn!(
                    object = %object.name,
                    generation = %object.generation,
                    error = %e,
                    "Object failed, will be retried next cycle"
                );
            }
        }
    }

    /// Save failures are logged, not fatal: unsaved progress is re-published
    /// after a restart.
    async fn persist(&self) {
        if let Err(e) = self
            .state
            .save(self.cursor.bucket(), self.cursor.snapshot())
            .await
        {
            error!(error = %e, path = %self.state.path().display(), "Failed to persist cursor state");
        }
    }

    fn status_guard(&self) -> std::sync::MutexGuard<'_, Option<Status>> {
        self.last_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_status(&self) -> Option<Status> {
        *self.status_guard()
    }

    fn report(&self, status: Status, message: &str) {
        let mut last = self.status_guard();
        if *last == Some(status) {
            return;
        }
        *last = Some(status);
        self.status.update_status(&self.source.bucket, status, message);
    }
}

/// Build a scheduler for every configured bucket and run them all.
///
/// A bucket whose settings are rejected (for example an invalid selector regex)
/// is reported `Failed` and its error is returned once the remaining buckets
/// have finished; it never keeps them from starting.
pub async fn run_input(
    input: &InputConfig,
    ctx: &SchedulerContext,
    once: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let mut schedulers = Vec::new();
    let mut rejected = None;

    for settings in input.resolved_buckets() {
        match SourceDescriptor::new(&input.project_id, &settings, &input.retry) {
            Ok(mut source) => {
                if once {
                    source.poll = false;
                }
                schedulers.push(Scheduler::new(source, ctx).await);
            }
            Err(e) => {
                error!(bucket = %settings.name, error = %e, "Bucket configuration rejected");
                ctx.status
                    .update_status(&settings.name, Status::Failed, &e.to_string());
                rejected.get_or_insert(e);
            }
        }
    }

    info!(
        input_id = %input.id,
        buckets = schedulers.len(),
        rejected = rejected.is_some(),
        once,
        "Starting input"
    );

    match (run_all(schedulers, cancel).await, rejected) {
        (Err(e), _) if !e.is_cancelled() => Err(e),
        (_, Some(e)) => Err(e),
        (result, None) => result,
    }
}

/// Run every bucket concurrently. A bucket failing does not stop the others;
/// the first such failure is returned once all have finished.
pub async fn run_all(schedulers: Vec<Scheduler>, cancel: CancellationToken) -> Result<()> {
    let mut tasks = JoinSet::new();
    for scheduler in schedulers {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let result = scheduler.schedule(cancel).await;
            (scheduler.bucket().to_string(), result)
        });
    }

    let mut first_error = None;
    let mut cancelled = false;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((_, Err(e))) if e.is_cancelled() => cancelled = true,
            Ok((bucket, Err(e))) => {
                error!(bucket = %bucket, error = %e, "Bucket input stopped");
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!(error = %e, "Bucket task failed");
                first_error.get_or_insert(Error::Internal(format!("bucket task failed: {}", e)));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None if cancelled => Err(Error::Cancelled),
        None => Ok(()),
    }
}
