//! Backing stores of the queue.
//!
//! Every store implements [`QueueDriver`]. Claiming must be atomic at the store level:
//! a job id is never handed to two concurrent callers of [`QueueDriver::claim_batch`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_job::{DeadLetterRecord, Job, JobId, JobPayload};
use serde::Serialize;

use crate::errors::Result;

pub mod database;
pub mod memory;
pub mod redis;
pub mod sync;

pub use self::database::DatabaseDriver;
pub use self::memory::MemoryDriver;
pub use self::redis::RedisDriver;
pub use self::sync::SyncDriver;

/// Job totals of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Not reserved, delayed ones included
    pub waiting: u64,
    /// Reserved by a worker
    pub active: u64,
    /// Acknowledged since the driver started
    pub completed: u64,
    /// Dead-lettered
    pub failed: u64,
}

#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether `enqueue` runs the job instead of persisting it
    fn runs_inline(&self) -> bool {
        false
    }

    /// Persists a job, claimable from `available_at`
    async fn enqueue(
        &self,
        queue: &str,
        payload: &JobPayload,
        available_at: DateTime<Utc>,
    ) -> Result<JobId>;

    /// Reserves up to `limit` available jobs, counting an attempt on each.
    ///
    /// `queue` restricts the claim to one queue, `None` claims from all of them.
    async fn claim_batch(&self, queue: Option<&str>, limit: usize) -> Result<Vec<Job>>;

    /// Removes a completed job.
    ///
    /// `claim` is the job as [`QueueDriver::claim_batch`] returned it. `ack`, `release` and
    /// `dead_letter` only apply while the job is still reserved under that claim, otherwise
    /// nothing changes and [`QueueError::ReservationLost`] is returned.
    ///
    /// [`QueueError::ReservationLost`]: crate::errors::QueueError::ReservationLost
    async fn ack(&self, claim: &Job) -> Result<()>;

    /// Clears the reservation, the job becomes claimable again at `available_at`
    async fn release(&self, claim: &Job, available_at: DateTime<Utc>) -> Result<()>;

    /// Moves the job to the dead-letter store
    async fn dead_letter(&self, claim: &Job, reason: &str) -> Result<DeadLetterRecord>;

    async fn counts(&self) -> Result<JobCounts>;

    /// Releases jobs reserved for longer than `threshold`, available immediately.
    /// Attempts are left untouched.
    async fn release_stalled(&self, threshold: Duration) -> Result<Vec<Job>>;

    /// Jobs waiting on `queue`, reserved ones excluded
    async fn size(&self, queue: &str) -> Result<u64>;

    /// Deletes every unreserved job of `queue`, returning how many were removed
    async fn clear(&self, queue: &str) -> Result<u64>;

    /// Dead-letter records, oldest first
    async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>>;

    /// Turns a dead-letter record back into a fresh job with no attempts
    async fn retry_dead_letter(&self, id: &JobId) -> Result<JobId>;

    /// Deletes a dead-letter record, returning whether it existed
    async fn forget_dead_letter(&self, id: &JobId) -> Result<bool>;

    async fn flush_dead_letters(&self) -> Result<u64>;
}

/// Converts a std duration, saturating at a century
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// `at + duration`, saturating at the latest representable instant
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(chrono_duration(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
