use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Starting,
    Configuring,
    Running,
    /// Running, but the last cycle left objects unprocessed.
    Degraded,
    Failed,
    Stopping,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Starting => "starting",
            Status::Configuring => "configuring",
            Status::Running => "running",
            Status::Degraded => "degraded",
            Status::Failed => "failed",
            Status::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Observes lifecycle transitions; must never block the caller.
pub trait StatusReporter: Send + Sync {
    fn update_status(&self, bucket: &str, status: Status, message: &str);
}

pub struct LogStatusReporter;

impl StatusReporter for LogStatusReporter {
    fn update_status(&self, bucket: &str, status: Status, message: &str) {
        match status {
            Status::Degraded | Status::Failed => {
                warn!(bucket, status = %status, message, "Input status changed")
            }
            _ => info!(bucket, status = %status, message, "Input status changed"),
        }
    }
}

pub struct NoopStatusReporter;

impl StatusReporter for NoopStatusReporter {
    fn update_status(&self, _bucket: &str, _status: Status, _message: &str) {}
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct RecordingStatusReporter {
        updates: Arc<Mutex<Vec<(String, Status)>>>,
    }

    impl RecordingStatusReporter {
        pub fn statuses(&self, bucket: &str) -> Vec<Status> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .filter(|(b, _)| b == bucket)
                .map(|(_, s)| *s)
                .collect()
        }
    }

    impl StatusReporter for RecordingStatusReporter {
        fn update_status(&self, bucket: &str, status: Status, _message: &str) {
            self.updates
                .lock()
                .unwrap()
                .push((bucket.to_string(), status));
        }
    }
}
