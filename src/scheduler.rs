use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use getset::Getters;
use jobqueue_crontab_parser::CronSchedule;
use jobqueue_events::{QueueEvent, Subscription};
use jobqueue_job::JobId;
use jobqueue_shutdown_signal::{never, shutdown_signal, ShutdownSignal};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::{Dispatch, DispatchOptions, DispatchStatus, JobHandle, Queue},
    driver::chrono_duration,
    errors::{QueueError, Result},
};

/// Public view of a scheduled job
#[derive(Debug, Clone, PartialEq, Serialize, Getters)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    name: String,
    /// Expression as configured, alias included
    expression: String,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    is_running: bool,
    without_overlapping: bool,
}

/// Run of a `without_overlapping` job that has not finished yet
struct Running {
    since: DateTime<Utc>,
    /// `None` between the start of the dispatch and its handle coming back
    job_id: Option<JobId>,
}

struct Entry {
    schedule: CronSchedule,
    /// Wall-clock minute of the last dispatch, in the evaluation time zone
    last_run_naive: Option<NaiveDateTime>,
    running: Option<Running>,
    job: ScheduledJob,
}

impl Entry {
    fn start(&mut self, at: DateTime<Utc>) {
        self.running = Some(Running {
            since: at,
            job_id: None,
        });
        self.job.is_running = true;
    }

    fn finish(&mut self) {
        self.running = None;
        self.job.is_running = false;
    }

    /// Whether a finished job, as reported by an event, is the run in progress
    fn is_running_job(&self, job_id: Option<&str>) -> bool {
        match &self.running {
            Some(Running {
                job_id: Some(running),
                ..
            }) => job_id == Some(running.as_str()),
            // Finished before its handle was recorded, only the name can tell
            Some(Running { job_id: None, .. }) => true,
            None => false,
        }
    }
}

const DEFAULT_OVERLAP_EXPIRY_SECONDS: u64 = 24 * 60 * 60;

type Entries = Arc<Mutex<BTreeMap<String, Entry>>>;

fn lock(entries: &Mutex<BTreeMap<String, Entry>>) -> MutexGuard<'_, BTreeMap<String, Entry>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

/// Configuration of a [`Scheduler`]
#[derive(Default)]
pub struct SchedulerOptions {
    queue: Option<Queue>,
    /// How often schedules are evaluated
    check_interval: Option<Duration>,
    /// Evaluate cron expressions in the local time zone instead of UTC
    use_local_time: bool,
    /// How long a run of a job without overlapping may block the next ones
    overlap_expiry: Option<Duration>,
    listen_os_shutdown_signals: Option<bool>,
}

#[derive(Error, Debug)]
pub enum SchedulerBuildError {
    #[error("Missing queue configuration - the scheduler dispatches through a Queue")]
    MissingQueue,
}

impl SchedulerOptions {
    /// Facade scheduled jobs are dispatched through. Its registry provides the schedules.
    pub fn queue(mut self, queue: Queue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn check_interval(mut self, value: Duration) -> Self {
        self.check_interval = Some(value);
        self
    }

    pub fn use_local_time(mut self, value: bool) -> Self {
        self.use_local_time = value;
        self
    }

    /// Runs of jobs configured without overlapping stop blocking after this long, even if
    /// their completion was never seen. 24 hours by default.
    pub fn overlap_expiry(mut self, value: Duration) -> Self {
        self.overlap_expiry = Some(value);
        self
    }

    pub fn listen_os_shutdown_signals(mut self, value: bool) -> Self {
        self.listen_os_shutdown_signals = Some(value);
        self
    }

    /// Builds the scheduler and registers every job declaring a schedule.
    ///
    /// A job whose expression cannot be parsed is skipped with a warning.
    pub fn init(self) -> std::result::Result<Scheduler, SchedulerBuildError> {
        let queue = self.queue.ok_or(SchedulerBuildError::MissingQueue)?;
        let shutdown_signal = if self.listen_os_shutdown_signals.unwrap_or(true) {
            shutdown_signal()
        } else {
            never()
        };

        let scheduler = Scheduler {
            queue,
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            check_interval: self.check_interval.unwrap_or(Duration::from_secs(60)),
            use_local_time: self.use_local_time,
            overlap_expiry: self
                .overlap_expiry
                .unwrap_or(Duration::from_secs(DEFAULT_OVERLAP_EXPIRY_SECONDS)),
            shutdown_signal,
            shutdown: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
        };
        scheduler.register_all();
        scheduler.watch_completions();
        Ok(scheduler)
    }
}

/// Dispatches registered jobs on their cron schedule.
///
/// Only one scheduler should run per deployment, two of them dispatch every job twice.
pub struct Scheduler {
    queue: Queue,
    entries: Entries,
    check_interval: Duration,
    use_local_time: bool,
    overlap_expiry: Duration,
    shutdown_signal: ShutdownSignal,
    shutdown: CancellationToken,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Scheduler {
    pub fn options() -> SchedulerOptions {
        SchedulerOptions::default()
    }

    fn register_all(&self) {
        let now = self.queue.context().now();
        let registry = self.queue.context().registry().clone();
        let mut entries = lock(&self.entries);

        for (name, config) in registry.scheduled() {
            let Some(expression) = config.schedule() else {
                continue;
            };
            let schedule = match expression.parse::<CronSchedule>() {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(job_name = %name, expression, error = %e, "Invalid schedule, job will not be scheduled");
                    continue;
                }
            };
            let next_run = self.next_run(&schedule, now);
            debug!(job_name = %name, expression, next_run = ?next_run, "Scheduling job");
            entries.insert(
                name.to_string(),
                Entry {
                    schedule,
                    last_run_naive: None,
                    running: None,
                    job: ScheduledJob {
                        name: name.to_string(),
                        expression: expression.clone(),
                        last_run: None,
                        next_run,
                        is_running: false,
                        without_overlapping: *config.without_overlapping(),
                    },
                },
            );
        }
        info!(count = entries.len(), "Scheduler registered jobs");
    }

    /// Clears the running flag once the dispatched run finished, either way
    fn watch_completions(&self) {
        let events = self.queue.context().events().clone();
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for event in [QueueEvent::JobCompleted, QueueEvent::JobFailed] {
            let entries = self.entries.clone();
            subscriptions.push(events.on(event, move |payload| {
                let entries = entries.clone();
                async move {
                    let Some(name) = payload.job_name() else {
                        return;
                    };
                    if let Some(entry) = lock(&entries).get_mut(name) {
                        if entry.is_running_job(payload.job_id().as_deref()) {
                            entry.finish();
                        }
                    }
                }
            }));
        }
    }

    fn local_naive(&self, at: DateTime<Utc>) -> NaiveDateTime {
        if self.use_local_time {
            at.with_timezone(&Local).naive_local()
        } else {
            at.naive_utc()
        }
    }

    fn next_run(&self, schedule: &CronSchedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = schedule.next_run_after(&self.local_naive(after))?;
        if self.use_local_time {
            Local
                .from_local_datetime(&next)
                .earliest()
                .map(|at| at.with_timezone(&Utc))
        } else {
            Some(next.and_utc())
        }
    }

    /// Dispatches every job due now. Returns the handles of the dispatched jobs.
    ///
    /// A job never fires twice in the same minute. A job configured without overlapping
    /// is skipped while its previous run has not completed or failed.
    pub async fn check_scheduled_jobs(&self) -> Result<Vec<JobHandle>> {
        let now = self.queue.context().now();
        let naive_now = self.local_naive(now);

        let due: Vec<String> = {
            let mut entries = lock(&self.entries);
            entries
                .iter_mut()
                .filter(|(_, entry)| {
                    entry
                        .schedule
                        .should_run(&naive_now, entry.last_run_naive.as_ref())
                })
                .filter_map(|(name, entry)| {
                    if let Some(running) = &entry.running {
                        let expires_at = running
                            .since
                            .checked_add_signed(chrono_duration(self.overlap_expiry));
                        if expires_at.map_or(true, |expires_at| now < expires_at) {
                            debug!(job_name = %name, "Previous run still going, skipping");
                            return None;
                        }
                        warn!(
                            job_name = %name,
                            since = %running.since,
                            "Previous run never reported completion, overlap lock expired"
                        );
                        entry.finish();
                    }
                    entry.last_run_naive = Some(naive_now);
                    entry.job.last_run = Some(now);
                    if entry.job.without_overlapping {
                        entry.start(now);
                    }
                    Some(name.clone())
                })
                .collect()
        };

        let mut handles = Vec::with_capacity(due.len());
        let mut first_error = None;
        for name in due {
            match self.dispatch(&name).await {
                Ok(handle) => {
                    info!(job_name = %name, "Dispatched scheduled job");
                    if let Some(entry) = lock(&self.entries).get_mut(&name) {
                        let queued_id = match handle.status() {
                            DispatchStatus::Queued => handle.id().clone(),
                            _ => None,
                        };
                        if entry.running.is_some() {
                            match queued_id {
                                Some(id) => {
                                    entry.running = Some(Running {
                                        since: now,
                                        job_id: Some(id),
                                    })
                                }
                                // Ran inline or left to a later flush, nothing to wait for
                                None => entry.finish(),
                            }
                        }
                    }
                    handles.push(handle);
                }
                Err(e) => {
                    error!(job_name = %name, error = %e, "Could not dispatch scheduled job");
                    if let Some(entry) = lock(&self.entries).get_mut(&name) {
                        entry.finish();
                    }
                    first_error.get_or_insert(e);
                }
            }
            let mut entries = lock(&self.entries);
            if let Some(entry) = entries.get_mut(&name) {
                entry.job.next_run = self.next_run(&entry.schedule, now);
            }
        }

        match first_error {
            Some(e) if handles.is_empty() => Err(e),
            _ => Ok(handles),
        }
    }

    async fn dispatch(&self, name: &str) -> Result<JobHandle> {
        self.queue
            .dispatch(name, Value::Object(Default::default()), DispatchOptions::new())
            .await
    }

    /// Dispatches `name` right away, outside of its schedule
    pub async fn trigger_job(&self, name: &str) -> Result<JobHandle> {
        if !lock(&self.entries).contains_key(name) {
            return Err(QueueError::UnknownScheduledJob(name.to_string()));
        }
        let now = self.queue.context().now();
        let handle = self.dispatch(name).await?;
        info!(job_name = %name, "Triggered scheduled job manually");
        if let Some(entry) = lock(&self.entries).get_mut(name) {
            entry.job.last_run = Some(now);
        }
        Ok(handle)
    }

    /// Registered jobs, by name
    pub fn status(&self) -> Vec<ScheduledJob> {
        lock(&self.entries)
            .values()
            .map(|entry| entry.job.clone())
            .collect()
    }

    /// Stops [`Self::run`] and forgets every registered job
    pub fn stop(&self) {
        self.shutdown.cancel();
        lock(&self.entries).clear();
        let events = self.queue.context().events();
        for subscription in self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            events.unsubscribe(subscription);
        }
        info!("Scheduler stopped");
    }

    /// Evaluates schedules every `check_interval` until stopped or a shutdown signal arrives
    pub async fn run(&self) {
        info!(
            check_interval = ?self.check_interval,
            jobs = lock(&self.entries).len(),
            "Scheduler started"
        );
        loop {
            if let Err(e) = self.check_scheduled_jobs().await {
                let message = e.to_string();
                self.queue
                    .context()
                    .emit(QueueEvent::QueueError, |p| p.with_error(message))
                    .await;
            }

            tokio::select! {
                _ = self.shutdown_signal.clone() => break,
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
        self.stop();
    }
}
