use metrics::{counter, gauge, Counter, Gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Per-bucket counters. Each update goes to the global `metrics` recorder and to
/// a local total that survives without one (tests, shutdown summary).
pub struct InputMetrics {
    input_id: String,
    objects_discovered: Counter,
    objects_processed: Counter,
    objects_skipped: Counter,
    object_errors: Counter,
    events_published: Counter,
    bytes_transferred: Counter,
    retries: Counter,
    empty_cycles: Counter,
    cursor_evictions: Counter,
    in_flight: Gauge,
    cursor_entries: Gauge,
    totals: Totals,
}

#[derive(Default)]
struct Totals {
    objects_discovered: AtomicU64,
    objects_processed: AtomicU64,
    objects_skipped: AtomicU64,
    object_errors: AtomicU64,
    events_published: AtomicU64,
    bytes_transferred: AtomicU64,
    retries: AtomicU64,
    empty_cycles: AtomicU64,
    cursor_evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub objects_discovered: u64,
    pub objects_processed: u64,
    pub objects_skipped: u64,
    pub object_errors: u64,
    pub events_published: u64,
    pub bytes_transferred: u64,
    pub retries: u64,
    pub empty_cycles: u64,
    pub cursor_evictions: u64,
}

impl InputMetrics {
    /// `input_id` is `<input id>:<bucket>`, `url` the bucket's storage URL.
    pub fn new(input_id: String, url: String) -> Self {
        let labels = [("input_id", input_id.clone()), ("url", url)];

        Self {
            objects_discovered: counter!("shipper_objects_discovered_total", &labels),
            objects_processed: counter!("shipper_objects_processed_total", &labels),
            objects_skipped: counter!("shipper_objects_skipped_total", &labels),
            object_errors: counter!("shipper_object_errors_total", &labels),
            events_published: counter!("shipper_events_published_total", &labels),
            bytes_transferred: counter!("shipper_bytes_transferred_total", &labels),
            retries: counter!("shipper_object_retries_total", &labels),
            empty_cycles: counter!("shipper_empty_cycles_total", &labels),
            cursor_evictions: counter!("shipper_cursor_evictions_total", &labels),
            in_flight: gauge!("shipper_in_flight_objects", &labels),
            cursor_entries: gauge!("shipper_cursor_entries", &labels),
            input_id,
            totals: Totals::default(),
        }
    }

    pub fn discovered(&self, n: u64) {
        self.objects_discovered.increment(n);
        self.totals.objects_discovered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn processed(&self) {
        self.objects_processed.increment(1);
        self.totals.objects_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self, n: u64) {
        self.objects_skipped.increment(n);
        self.totals.objects_skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn object_error(&self) {
        self.object_errors.increment(1);
        self.totals.object_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self, n: u64) {
        self.events_published.increment(n);
        self.totals.events_published.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes(&self, n: u64) {
        self.bytes_transferred.increment(n);
        self.totals.bytes_transferred.fetch_add(n, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retries.increment(1);
        self.totals.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn no_new_objects(&self) {
        self.empty_cycles.increment(1);
        self.totals.empty_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self, n: u64) {
        self.cursor_evictions.increment(n);
        self.totals.cursor_evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn in_flight(&self, n: usize) {
        self.in_flight.set(n as f64);
    }

    pub fn cursor_entries(&self, n: usize) {
        self.cursor_entries.set(n as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let t = &self.totals;
        MetricsSnapshot {
            objects_discovered: t.objects_discovered.load(Ordering::Relaxed),
            objects_processed: t.objects_processed.load(Ordering::Relaxed),
            objects_skipped: t.objects_skipped.load(Ordering::Relaxed),
            object_errors: t.object_errors.load(Ordering::Relaxed),
            events_published: t.events_published.load(Ordering::Relaxed),
            bytes_transferred: t.bytes_transferred.load(Ordering::Relaxed),
            retries: t.retries.load(Ordering::Relaxed),
            empty_cycles: t.empty_cycles.load(Ordering::Relaxed),
            cursor_evictions: t.cursor_evictions.load(Ordering::Relaxed),
        }
    }

    /// Zero the gauges and log the run totals.
    pub fn close(&self) {
        self.in_flight.set(0.0);
        let s = self.snapshot();
        info!(
            input_id = %self.input_id,
            discovered = s.objects_discovered,
            processed = s.objects_processed,
            errors = s.object_errors,
            events = s.events_published,
            bytes = s.bytes_transferred,
            retries = s.retries,
            "Input metrics closed"
        );
    }
}
