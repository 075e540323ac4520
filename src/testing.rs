//! Test double for code that dispatches jobs.
//!
//! ```
//! use jobqueue::{testing::FakeQueue, Dispatch, DispatchOptions};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> jobqueue::Result<()> {
//! let queue = FakeQueue::new();
//! queue
//!     .dispatch("SendWelcomeEmail", json!({"user": 1}), DispatchOptions::builder().queue("emails").build())
//!     .await?;
//!
//! queue.assert_dispatched("SendWelcomeEmail");
//! queue.assert_pushed_on("emails", "SendWelcomeEmail");
//! queue.assert_not_dispatched("SendInvoice");
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use getset::Getters;
use jobqueue_job::{JobId, DEFAULT_QUEUE};
use serde_json::Value;

use crate::{
    dispatch::{Dispatch, DispatchOptions, DispatchStatus, JobHandle},
    errors::Result,
};

/// A recorded call to [`Dispatch::dispatch`]
#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct DispatchedJob {
    name: String,
    data: Value,
    options: DispatchOptions,
}

impl DispatchedJob {
    /// Queue the job would have landed on
    pub fn queue(&self) -> &str {
        self.options.queue().as_deref().unwrap_or(DEFAULT_QUEUE)
    }
}

/// Records dispatches instead of running or persisting them
#[derive(Debug, Default)]
pub struct FakeQueue {
    dispatched: Mutex<Vec<DispatchedJob>>,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn recorded(&self) -> MutexGuard<'_, Vec<DispatchedJob>> {
        self.dispatched.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dispatches of `name`, in call order
    pub fn dispatched(&self, name: &str) -> Vec<DispatchedJob> {
        self.recorded()
            .iter()
            .filter(|job| job.name == name)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<DispatchedJob> {
        self.recorded().clone()
    }

    pub fn clear(&self) {
        self.recorded().clear();
    }

    #[track_caller]
    pub fn assert_dispatched(&self, name: &str) {
        assert!(
            !self.dispatched(name).is_empty(),
            "Expected job `{name}` to be dispatched"
        );
    }

    #[track_caller]
    pub fn assert_dispatched_times(&self, name: &str, times: usize) {
        let count = self.dispatched(name).len();
        assert_eq!(
            count, times,
            "Expected job `{name}` to be dispatched {times} times, got {count}"
        );
    }

    #[track_caller]
    pub fn assert_not_dispatched(&self, name: &str) {
        assert!(
            self.dispatched(name).is_empty(),
            "Unexpected dispatch of job `{name}`"
        );
    }

    #[track_caller]
    pub fn assert_nothing_dispatched(&self) {
        let names: Vec<String> = self.recorded().iter().map(|job| job.name.clone()).collect();
        assert!(names.is_empty(), "Expected no dispatch, got {names:?}");
    }

    #[track_caller]
    pub fn assert_pushed_on(&self, queue: &str, name: &str) {
        assert!(
            self.dispatched(name).iter().any(|job| job.queue() == queue),
            "Expected job `{name}` to be pushed on queue `{queue}`"
        );
    }

    /// Passes when at least one dispatch of `name` satisfies `predicate`
    #[track_caller]
    pub fn assert_dispatched_with<F>(&self, name: &str, predicate: F)
    where
        F: Fn(&DispatchedJob) -> bool,
    {
        assert!(
            self.dispatched(name).iter().any(predicate),
            "No dispatch of job `{name}` matches the predicate"
        );
    }
}

#[async_trait]
impl Dispatch for FakeQueue {
    async fn dispatch(
        &self,
        name: &str,
        data: Value,
        options: DispatchOptions,
    ) -> Result<JobHandle> {
        let mut recorded = self.recorded();
        let job = DispatchedJob {
            name: name.to_string(),
            data,
            options,
        };
        let handle = JobHandle::new(
            Some(JobId::from(recorded.len() as u64 + 1)),
            name,
            job.options.connection().clone().unwrap_or_else(|| "fake".to_string()),
            job.queue(),
            DispatchStatus::Queued,
        );
        recorded.push(job);
        Ok(handle)
    }
}
