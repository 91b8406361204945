use crate::model::Event;
use async_trait::async_trait;
use shipper_core::{Error, Result};
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

/// Downstream event sink. A failed publish fails the whole object.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Writes each event as one JSON line on stdout.
pub struct StdoutPublisher {
    out: Mutex<Stdout>,
}

impl StdoutPublisher {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for StdoutPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| Error::Publish(format!("stdout write failed: {}", e)))?;
        out.flush()
            .await
            .map_err(|e| Error::Publish(format!("stdout flush failed: {}", e)))
    }
}
