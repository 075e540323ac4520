use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use getset::Getters;
use jobqueue_job::{Job, JobId};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::clock::{Clock, SystemClock};

/// What the failure notifier learns about a job that exhausted its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Getters)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct FailedJobInfo {
    id: JobId,
    name: String,
    queue: String,
    payload: Value,
    exception: String,
    failed_at: DateTime<Utc>,
    attempts: u32,
    max_attempts: u32,
}

impl FailedJobInfo {
    pub fn from_job(job: &Job, exception: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            id: job.id().clone(),
            name: job.name().to_string(),
            queue: job.queue().clone(),
            payload: job.payload().data().clone(),
            exception: exception.into(),
            failed_at,
            attempts: *job.attempts(),
            max_attempts: job.max_tries(),
        }
    }
}

/// Receives permanent failures. Delivery (mail, chat, webhook) is up to the implementor.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, info: &FailedJobInfo) -> Result<(), String>;
}

/// Writes permanent failures to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl FailureNotifier for LogNotifier {
    async fn notify(&self, info: &FailedJobInfo) -> Result<(), String> {
        error!(
            job_id = %info.id,
            job_name = info.name,
            queue = info.queue,
            attempts = info.attempts,
            max_attempts = info.max_attempts,
            exception = info.exception,
            "Job failed permanently"
        );
        Ok(())
    }
}

type NotificationFilter = Arc<dyn Fn(&FailedJobInfo) -> bool + Send + Sync>;

/// Wraps a notifier with a filter and an hourly rate limit
pub struct NotificationPolicy {
    inner: Arc<dyn FailureNotifier>,
    filter: Option<NotificationFilter>,
    max_per_hour: Option<usize>,
    clock: Arc<dyn Clock>,
    sent: Mutex<VecDeque<DateTime<Utc>>>,
}

impl Debug for NotificationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationPolicy")
            .field("filter", &self.filter.is_some())
            .field("max_per_hour", &self.max_per_hour)
            .finish()
    }
}

impl NotificationPolicy {
    pub fn new(inner: Arc<dyn FailureNotifier>) -> Self {
        Self {
            inner,
            filter: None,
            max_per_hour: None,
            clock: Arc::new(SystemClock),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Only failures for which `filter` returns true are forwarded
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&FailedJobInfo) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_max_per_hour(mut self, max: usize) -> Self {
        self.max_per_hour = Some(max);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Records a send when the hourly budget allows it
    fn take_slot(&self) -> bool {
        let Some(max) = self.max_per_hour else {
            return true;
        };
        let now = self.clock.now();
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        while sent
            .front()
            .is_some_and(|at| now - *at >= Duration::hours(1))
        {
            sent.pop_front();
        }
        if sent.len() >= max {
            return false;
        }
        sent.push_back(now);
        true
    }
}

#[async_trait]
impl FailureNotifier for NotificationPolicy {
    async fn notify(&self, info: &FailedJobInfo) -> Result<(), String> {
        if let Some(filter) = &self.filter {
            if !filter(info) {
                debug!(job_id = %info.id, job_name = info.name, "Failure notification filtered out");
                return Ok(());
            }
        }
        if !self.take_slot() {
            debug!(job_id = %info.id, job_name = info.name, "Failure notification rate limited");
            return Ok(());
        }
        self.inner.notify(info).await
    }
}
