use std::{sync::Arc, time::Duration};

use jobqueue_events::QueueEvent;
use jobqueue_job::Job;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{context::QueueContext, driver::QueueDriver, errors::Result};

/// Hands out again jobs whose reservation outlived `threshold`, typically because the
/// process running them died.
pub struct Reaper {
    driver: Arc<dyn QueueDriver>,
    ctx: QueueContext,
    threshold: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        driver: Arc<dyn QueueDriver>,
        ctx: QueueContext,
        threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            driver,
            ctx,
            threshold,
            interval,
        }
    }

    /// Releases every stalled job once and emits `job:stalled` for each.
    ///
    /// Two reapers sweeping concurrently never release the same job twice, the driver
    /// only returns the jobs it actually released.
    pub async fn sweep(&self) -> Result<Vec<Job>> {
        let released = self.driver.release_stalled(self.threshold).await?;
        if !released.is_empty() {
            warn!(count = released.len(), "Released stalled jobs");
        }
        for job in &released {
            self.ctx
                .emit(QueueEvent::JobStalled, |p| {
                    p.with_job_id(job.id().as_str())
                        .with_job_name(job.name())
                        .with_queue_name(job.queue().as_str())
                        .with_attempts_made(*job.attempts())
                })
                .await;
        }
        Ok(released)
    }

    /// Sweeps every `interval` until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            threshold = ?self.threshold,
            interval = ?self.interval,
            "Stalled job reaper started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Could not release stalled jobs");
                let message = e.to_string();
                self.ctx
                    .emit(QueueEvent::QueueError, |p| p.with_error(message))
                    .await;
            }
        }
    }
}
