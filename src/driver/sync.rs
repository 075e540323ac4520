use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_events::QueueEvent;
use jobqueue_job::{DeadLetterRecord, Job, JobId, JobPayload};
use jobqueue_task_handler::JobContext;
use tracing::{debug, warn};

use super::{JobCounts, QueueDriver};
use crate::{
    context::QueueContext,
    errors::{QueueError, Result},
};

/// Runs jobs inline when they are enqueued. Nothing is persisted and failures are
/// returned to the caller instead of being retried.
pub struct SyncDriver {
    ctx: QueueContext,
    next_id: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl SyncDriver {
    pub fn new(ctx: QueueContext) -> Self {
        Self {
            ctx,
            next_id: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl QueueDriver for SyncDriver {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn runs_inline(&self) -> bool {
        true
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: &JobPayload,
        available_at: DateTime<Utc>,
    ) -> Result<JobId> {
        let id = JobId::from(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let name = payload.name().clone();
        if available_at > self.ctx.now() {
            debug!(job_id = %id, job_name = name, "Sync driver ignores dispatch delay");
        }

        self.ctx
            .emit(QueueEvent::JobProcessing, |p| {
                p.with_job_id(id.as_str())
                    .with_job_name(name.as_str())
                    .with_queue_name(queue)
                    .with_attempts_made(1)
            })
            .await;

        let job_ctx = JobContext::new(
            id.as_str(),
            queue,
            name.as_str(),
            1,
            *payload.options().tries(),
            payload.data().clone(),
        );
        let start = Instant::now();
        let result = self
            .ctx
            .registry()
            .run(&name, payload.data().clone(), job_ctx)
            .await;
        let duration = start.elapsed();

        match result {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.ctx
                    .emit(QueueEvent::JobCompleted, |p| {
                        p.with_job_id(id.as_str())
                            .with_job_name(name.as_str())
                            .with_queue_name(queue)
                            .with_attempts_made(1)
                            .with_duration(duration)
                    })
                    .await;
                Ok(id)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %id, job_name = name, error = %e, "Inline job failed");
                let message = e.to_string();
                self.ctx
                    .emit(QueueEvent::JobFailed, |p| {
                        p.with_job_id(id.as_str())
                            .with_job_name(name.as_str())
                            .with_queue_name(queue)
                            .with_attempts_made(1)
                            .with_error(message)
                    })
                    .await;
                Err(QueueError::Handler(e))
            }
        }
    }

    async fn claim_batch(&self, _queue: Option<&str>, _limit: usize) -> Result<Vec<Job>> {
        Ok(Vec::new())
    }

    async fn ack(&self, claim: &Job) -> Result<()> {
        Err(QueueError::ReservationLost(claim.id().clone()))
    }

    async fn release(&self, claim: &Job, _available_at: DateTime<Utc>) -> Result<()> {
        Err(QueueError::ReservationLost(claim.id().clone()))
    }

    async fn dead_letter(&self, claim: &Job, _reason: &str) -> Result<DeadLetterRecord> {
        Err(QueueError::ReservationLost(claim.id().clone()))
    }

    async fn counts(&self) -> Result<JobCounts> {
        Ok(JobCounts {
            waiting: 0,
            active: 0,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        })
    }

    async fn release_stalled(&self, _threshold: Duration) -> Result<Vec<Job>> {
        Ok(Vec::new())
    }

    async fn size(&self, _queue: &str) -> Result<u64> {
        Ok(0)
    }

    async fn clear(&self, _queue: &str) -> Result<u64> {
        Ok(0)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        Ok(Vec::new())
    }

    async fn retry_dead_letter(&self, id: &JobId) -> Result<JobId> {
        Err(QueueError::DeadLetterNotFound(id.clone()))
    }

    async fn forget_dead_letter(&self, _id: &JobId) -> Result<bool> {
        Ok(false)
    }

    async fn flush_dead_letters(&self) -> Result<u64> {
        Ok(0)
    }
}
