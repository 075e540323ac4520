use std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use futures::FutureExt;
use getset::Getters;
use jobqueue_events::QueueEvent;
use jobqueue_job::{Job, JobId};
use jobqueue_shutdown_signal::ShutdownSignal;
use jobqueue_task_handler::{HandlerError, JobContext};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::{
    builder::ProcessorOptions,
    context::QueueContext,
    dispatch::Queue,
    driver::{add_duration, QueueDriver},
    errors::QueueError,
    notifications::FailedJobInfo,
    reaper::Reaper,
};

/// Polls a driver and runs the claimed jobs, never more than `concurrency` at once.
///
/// A failed job is released with a backoff delay until it runs out of tries, then it is
/// dead-lettered and handed to the failure notifier.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Processor {
    /// Unique identifier of this processor
    pub(crate) processor_id: String,
    /// Maximum number of jobs running at the same time
    pub(crate) concurrency: usize,
    /// Delay between two claims when nothing changed
    pub(crate) poll_interval: Duration,
    /// Only claim jobs of this queue, all queues when unset
    pub(crate) queue: Option<String>,
    /// How long to wait for running jobs on shutdown
    pub(crate) shutdown_timeout: Duration,
    pub(crate) stalled_threshold: Duration,
    pub(crate) stalled_check_interval: Duration,
    #[getset(skip)]
    pub(crate) driver: Arc<dyn QueueDriver>,
    pub(crate) ctx: QueueContext,
    /// Facade used to enqueue chained jobs on other connections
    #[getset(skip)]
    pub(crate) dispatcher: Option<Queue>,
    #[getset(skip)]
    pub(crate) shutdown_signal: ShutdownSignal,
    #[getset(skip)]
    pub(crate) shutdown: CancellationToken,
    #[getset(skip)]
    pub(crate) paused: AtomicBool,
    #[getset(skip)]
    pub(crate) active: Arc<Mutex<HashSet<JobId>>>,
}

/// Errors ending a run of the processor
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Claiming from the store failed during [`Processor::run_once`]
    #[error("Failed to claim jobs: {0}")]
    Claim(#[source] QueueError),
}

/// Error that occurs when the outcome of a job cannot be written back to the store
#[derive(Error, Debug)]
#[error("Failed to release job '{job_id}'. {source}")]
pub struct ProcessJobError {
    job_id: JobId,
    #[source]
    source: QueueError,
}

/// Why a handler run did not succeed
#[derive(Error, Debug)]
pub enum RunJobError {
    #[error("{0}")]
    Failed(String),
    #[error("Job timed out after {} seconds", .0.as_secs())]
    TimedOut(Duration),
    #[error("Job panicked: {0}")]
    Panicked(String),
    /// The job cannot be resolved to a handler
    #[error("{0}")]
    Unresolvable(HandlerError),
}

/// Everything a spawned job task needs
#[derive(Clone)]
struct JobRunner {
    processor_id: String,
    driver: Arc<dyn QueueDriver>,
    ctx: QueueContext,
    dispatcher: Option<Queue>,
}

fn lock(active: &Mutex<HashSet<JobId>>) -> MutexGuard<'_, HashSet<JobId>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

/// Concurrency slot of a running job, freed on drop so a panicking or aborted task
/// still gives it back
struct ActiveSlot {
    active: Arc<Mutex<HashSet<JobId>>>,
    id: JobId,
}

impl ActiveSlot {
    fn take(active: &Arc<Mutex<HashSet<JobId>>>, id: JobId) -> Self {
        lock(active).insert(id.clone());
        Self {
            active: active.clone(),
            id,
        }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.id);
    }
}

impl Processor {
    pub fn options() -> ProcessorOptions {
        ProcessorOptions::default()
    }

    fn runner(&self) -> JobRunner {
        JobRunner {
            processor_id: self.processor_id.clone(),
            driver: self.driver.clone(),
            ctx: self.ctx.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn QueueDriver> {
        &self.driver
    }

    /// Jobs currently running
    pub fn active_job_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Asks [`Self::run`] to stop: no more claims, running jobs get `shutdown_timeout` to finish
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stops claiming new jobs, running ones carry on
    pub async fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!(processor_id = %self.processor_id, "Processor paused");
            self.emit_worker_event(QueueEvent::QueuePaused).await;
        }
    }

    pub async fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!(processor_id = %self.processor_id, "Processor resumed");
            self.emit_worker_event(QueueEvent::QueueResumed).await;
        }
    }

    async fn emit_worker_event(&self, event: QueueEvent) {
        let processor_id = self.processor_id.as_str();
        let queue = self.queue.clone();
        self.ctx
            .emit(event, |p| {
                let p = p.with_processor_id(processor_id);
                match queue {
                    Some(queue) => p.with_queue_name(queue),
                    None => p,
                }
            })
            .await;
    }

    /// Resolves once an OS signal arrives or shutdown is requested
    async fn wait_for_shutdown(&self) {
        tokio::select! {
            _ = self.shutdown_signal.clone() => self.shutdown.cancel(),
            _ = self.shutdown.cancelled() => {}
        }
    }

    fn free_slots(&self) -> usize {
        self.concurrency.saturating_sub(self.active_job_count())
    }

    /// Claims as many jobs as there are free slots and spawns them
    async fn fill_slots(&self, tasks: &mut JoinSet<()>) -> Result<usize, QueueError> {
        let slots = self.free_slots();
        if slots == 0 {
            return Ok(0);
        }

        let jobs = self
            .driver
            .claim_batch(self.queue.as_deref(), slots)
            .await?;
        let claimed = jobs.len();
        if claimed > 0 {
            trace!(claimed, slots, "Claimed jobs");
        }

        for job in jobs {
            let slot = ActiveSlot::take(&self.active, job.id().clone());
            let runner = self.runner();
            let span = tracing::info_span!(
                "process_job",
                job_id = %job.id(),
                job_name = job.name(),
                queue = job.queue().as_str(),
            );
            tasks.spawn(
                async move {
                    let _slot = slot;
                    if let Err(e) = runner.process(job).await {
                        error!(error = %e, "Release job error");
                        runner.report_error(&e.to_string()).await;
                    }
                }
                .instrument(span),
            );
        }
        Ok(claimed)
    }

    /// Runs until a shutdown signal or [`Self::request_shutdown`].
    ///
    /// Store failures while polling are logged, reported as `queue:error` and retried on
    /// the next tick. Jobs still running when `shutdown_timeout` elapses are abandoned
    /// with their reservation in place, the reaper hands them out again later.
    pub async fn run(&self) -> Result<(), ProcessorError> {
        info!(
            processor_id = %self.processor_id,
            concurrency = self.concurrency,
            driver = self.driver.name(),
            "Processor started"
        );
        self.emit_worker_event(QueueEvent::WorkerStarted).await;

        let reaper = Reaper::new(
            self.driver.clone(),
            self.ctx.clone(),
            self.stalled_threshold,
            self.stalled_check_interval,
        );
        let poll_loop = self.poll_loop();
        let reaper_loop = reaper.run(self.shutdown.clone());
        futures::join!(poll_loop, reaper_loop);

        self.emit_worker_event(QueueEvent::WorkerStopped).await;
        info!(processor_id = %self.processor_id, "Processor stopped");
        Ok(())
    }

    async fn poll_loop(&self) {
        let mut tasks = JoinSet::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if !self.is_paused() {
                if let Err(e) = self.fill_slots(&mut tasks).await {
                    error!(error = %e, "Could not claim jobs");
                    self.runner().report_error(&e.to_string()).await;
                }
            }

            tokio::select! {
                _ = self.wait_for_shutdown() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.drain(tasks).await;
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        debug!(running = self.active_job_count(), "Waiting for running jobs");
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            let abandoned: Vec<String> = lock(&self.active).iter().map(JobId::to_string).collect();
            warn!(
                timeout = ?self.shutdown_timeout,
                abandoned = ?abandoned,
                "Shutdown timeout elapsed, leaving running jobs reserved"
            );
            tasks.abort_all();
            lock(&self.active).clear();
        }
    }

    /// Runs the jobs available right now, then returns.
    ///
    /// Jobs released with a delay are not waited for.
    pub async fn run_once(&self) -> Result<(), ProcessorError> {
        let mut tasks = JoinSet::new();
        loop {
            let claimed = self
                .fill_slots(&mut tasks)
                .await
                .map_err(ProcessorError::Claim)?;
            if claimed == 0 && tasks.is_empty() {
                break;
            }
            tasks.join_next().await;
        }
        Ok(())
    }
}

impl JobRunner {
    async fn report_error(&self, message: &str) {
        let processor_id = self.processor_id.as_str();
        self.ctx
            .emit(QueueEvent::QueueError, |p| {
                p.with_processor_id(processor_id).with_error(message)
            })
            .await;
    }

    async fn process(&self, job: Job) -> Result<(), ProcessJobError> {
        let attempts = *job.attempts();
        self.ctx
            .emit(QueueEvent::JobProcessing, |p| {
                p.with_job_id(job.id().as_str())
                    .with_job_name(job.name())
                    .with_queue_name(job.queue().as_str())
                    .with_attempts_made(attempts)
                    .with_processor_id(self.processor_id.as_str())
            })
            .await;

        let start = Instant::now();
        let result = self.run_job(&job).await;
        let duration = start.elapsed();

        let released = match result {
            Ok(()) => self.complete(&job, duration).await,
            Err(e) => self.fail(&job, e).await,
        };
        if let Err(QueueError::ReservationLost(_)) = released {
            warn!(
                attempts,
                "Job was recovered and handed out again while running, dropping this outcome"
            );
            return Ok(());
        }
        released.map_err(|source| ProcessJobError {
            job_id: job.id().clone(),
            source,
        })
    }

    /// Races the handler against the job timeout. A zero timeout disables the race.
    async fn run_job(&self, job: &Job) -> Result<(), RunJobError> {
        let job_ctx = JobContext::new(
            job.id().as_str(),
            job.queue().as_str(),
            job.name(),
            *job.attempts(),
            job.max_tries(),
            job.payload().data().clone(),
        );
        let cancellation = job_ctx.cancellation().clone();
        let handler = self
            .ctx
            .registry()
            .prepare(job.name(), job.payload().data().clone(), job_ctx)
            .map_err(RunJobError::Unresolvable)?;
        let handler = AssertUnwindSafe(handler).catch_unwind();

        let outcome = if job.timeout().is_zero() {
            handler.await
        } else {
            match tokio::time::timeout(job.timeout(), handler).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancellation.cancel();
                    return Err(RunJobError::TimedOut(job.timeout()));
                }
            }
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(RunJobError::Failed(message)),
            Err(panic) => Err(RunJobError::Panicked(panic_message(panic))),
        }
    }

    async fn complete(&self, job: &Job, duration: Duration) -> Result<(), QueueError> {
        self.driver.ack(job).await?;
        info!(
            attempts = *job.attempts(),
            duration = duration.as_millis() as u64,
            "Completed job with success"
        );
        self.ctx
            .emit(QueueEvent::JobCompleted, |p| {
                p.with_job_id(job.id().as_str())
                    .with_job_name(job.name())
                    .with_queue_name(job.queue().as_str())
                    .with_attempts_made(*job.attempts())
                    .with_duration(duration)
                    .with_processor_id(self.processor_id.as_str())
            })
            .await;

        if let Some(next) = job.payload().next_in_chain() {
            let next_name = next.payload().name().clone();
            let dispatched = match &self.dispatcher {
                Some(queue) => queue.dispatch_chained(next).await.map(|_| ()),
                None => self.enqueue_chained_locally(job, next).await,
            };
            if let Err(e) = dispatched {
                error!(error = %e, next_job = %next_name, "Could not enqueue chained job");
                return Err(e);
            }
            debug!(next_job = %next_name, "Chained job enqueued");
        }
        Ok(())
    }

    async fn enqueue_chained_locally(
        &self,
        job: &Job,
        next: jobqueue_job::ChainedJob,
    ) -> Result<(), QueueError> {
        if let Some(connection) = next.connection() {
            warn!(connection = %connection, "No dispatcher configured, chained job stays on the current driver");
        }
        let queue = next.queue().clone().unwrap_or_else(|| job.queue().clone());
        let delay = Duration::from_secs(next.delay().unwrap_or(0));
        let available_at = add_duration(self.ctx.now(), delay);
        let payload = next.into_payload();
        let id = self.driver.enqueue(&queue, &payload, available_at).await?;
        self.ctx
            .emit(QueueEvent::JobAdded, |p| {
                p.with_job_id(id.as_str())
                    .with_job_name(payload.name().as_str())
                    .with_queue_name(queue.as_str())
                    .with_data(payload.data().clone())
            })
            .await;
        Ok(())
    }

    async fn fail(&self, job: &Job, error: RunJobError) -> Result<(), QueueError> {
        let message = error.to_string();
        let attempts = *job.attempts();

        if job.can_retry() {
            let delay = jobqueue_backoff::delay(attempts, job.backoff());
            let retry_at = add_duration(self.ctx.now(), delay);
            warn!(
                error = %error,
                attempts,
                max_tries = job.max_tries(),
                delay = ?delay,
                "Failed job, retrying"
            );
            self.driver.release(job, retry_at).await?;
            self.ctx
                .emit(QueueEvent::JobRetrying, |p| {
                    p.with_job_id(job.id().as_str())
                        .with_job_name(job.name())
                        .with_queue_name(job.queue().as_str())
                        .with_attempts_made(attempts)
                        .with_error(message.as_str())
                        .with_delay(delay)
                        .with_processor_id(self.processor_id.as_str())
                })
                .await;
            return Ok(());
        }

        error!(
            error = %error,
            attempts,
            payload = ?job.payload().data(),
            "Job max attempts reached"
        );
        let record = self.driver.dead_letter(job, &message).await?;
        self.ctx
            .emit(QueueEvent::JobFailed, |p| {
                p.with_job_id(job.id().as_str())
                    .with_job_name(job.name())
                    .with_queue_name(job.queue().as_str())
                    .with_attempts_made(attempts)
                    .with_error(message.as_str())
                    .with_processor_id(self.processor_id.as_str())
            })
            .await;

        let info = FailedJobInfo::from_job(job, message.as_str(), *record.failed_at());
        if let Err(e) = self.ctx.notifier().notify(&info).await {
            warn!(error = e, "Failure notification could not be delivered");
        }
        Ok(())
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
