use crate::publish::{Publisher, StdoutPublisher};
use crate::scheduler::{self, SchedulerContext};
use crate::state::{RetentionPolicy, StateFile};
use crate::status::{LogStatusReporter, StatusReporter};
use crate::storage::{ObjectStorage, S3Storage};
use shipper_core::{Config, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

pub struct App {
    config: Config,
    storage: Arc<dyn ObjectStorage>,
    publisher: Arc<dyn Publisher>,
    status: Arc<dyn StatusReporter>,
    state: Arc<StateFile>,
}

impl App {
    #[instrument(skip(config))]
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing application");

        let storage = S3Storage::new(&config.storage).await?;
        let state = StateFile::load(&config.state.path).await;

        Ok(Self {
            storage: Arc::new(storage),
            publisher: Arc::new(StdoutPublisher::new()),
            status: Arc::new(LogStatusReporter),
            state: Arc::new(state),
            config,
        })
    }

    /// Run every configured bucket until done or interrupted. With `once`,
    /// polling is disabled and each bucket gets a single cycle.
    pub async fn run(&self, once: bool) -> Result<()> {
        let input = &self.config.input;
        let ctx = SchedulerContext {
            status: self.status.clone(),
            retention: RetentionPolicy::from_config(&self.config.state),
            shutdown_grace: Duration::from_secs(self.config.scheduler.shutdown_grace_secs),
            ..SchedulerContext::new(
                input.id.clone(),
                self.storage.clone(),
                self.publisher.clone(),
                self.state.clone(),
            )
        };

        let cancel = CancellationToken::new();
        let signals = tokio::spawn(shutdown_signal(cancel.clone()));

        info!(path = %self.state.path().display(), "Using cursor state");
        let result = scheduler::run_input(input, &ctx, once, cancel).await;
        signals.abort();

        match result {
            Err(e) if e.is_cancelled() => {
                info!("Shutdown complete");
                Ok(())
            }
            other => other,
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received, draining in-flight objects");
    cancel.cancel();
}
