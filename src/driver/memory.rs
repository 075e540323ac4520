use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_job::{DeadLetterRecord, Job, JobId, JobPayload};
use tracing::{debug, trace};

use super::{chrono_duration, JobCounts, QueueDriver};
use crate::{
    clock::Clock,
    errors::{QueueError, Result},
};

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    next_dead_letter_id: u64,
    /// Keyed by numeric id, so iteration follows insertion order
    jobs: BTreeMap<u64, Job>,
    dead_letters: BTreeMap<u64, DeadLetterRecord>,
    completed: u64,
}

impl MemoryState {
    fn insert(
        &mut self,
        queue: &str,
        payload: JobPayload,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobId {
        self.next_id += 1;
        let id = self.next_id;
        let job = Job::builder()
            .id(id)
            .queue(queue)
            .payload(payload)
            .available_at(available_at)
            .created_at(now)
            .build();
        self.jobs.insert(id, job);
        JobId::from(id)
    }

    /// Key of the job reserved under `claim`
    fn held(&self, claim: &Job) -> Result<u64> {
        let lost = || QueueError::ReservationLost(claim.id().clone());
        let key = parse_id(claim.id()).map_err(|_| lost())?;
        match self.jobs.get(&key) {
            Some(job) if job.is_held_by(claim) => Ok(key),
            _ => Err(lost()),
        }
    }
}

/// In-process store. Delayed jobs are promoted when their `available_at` has passed
/// at claim time, so the clock drives availability.
pub struct MemoryDriver {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryDriver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of a job still in the store
    pub fn job(&self, id: &JobId) -> Option<Job> {
        let key = parse_id(id).ok()?;
        self.state().jobs.get(&key).cloned()
    }
}

fn parse_id(id: &JobId) -> Result<u64> {
    id.as_str()
        .parse()
        .map_err(|_| QueueError::JobNotFound(id.clone()))
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: &JobPayload,
        available_at: DateTime<Utc>,
    ) -> Result<JobId> {
        let now = self.clock.now();
        let id = self.state().insert(queue, payload.clone(), available_at, now);
        trace!(job_id = %id, queue, "Job stored in memory");
        Ok(id)
    }

    async fn claim_batch(&self, queue: Option<&str>, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut state = self.state();

        let mut available: Vec<(DateTime<Utc>, u64)> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.is_available_at(now))
            .filter(|(_, job)| queue.map_or(true, |q| job.queue() == q))
            .map(|(id, job)| (*job.available_at(), *id))
            .collect();
        available.sort();

        let claimed = available
            .into_iter()
            .take(limit)
            .filter_map(|(_, id)| {
                let job = state.jobs.get_mut(&id)?;
                job.reserve(now);
                Some(job.clone())
            })
            .collect();
        Ok(claimed)
    }

    async fn ack(&self, claim: &Job) -> Result<()> {
        let mut state = self.state();
        let key = state.held(claim)?;
        state.jobs.remove(&key);
        state.completed += 1;
        Ok(())
    }

    async fn release(&self, claim: &Job, available_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let key = state.held(claim)?;
        if let Some(job) = state.jobs.get_mut(&key) {
            job.release(available_at);
        }
        Ok(())
    }

    async fn dead_letter(&self, claim: &Job, reason: &str) -> Result<DeadLetterRecord> {
        let now = self.clock.now();
        let mut state = self.state();
        let key = state.held(claim)?;
        let job = state
            .jobs
            .remove(&key)
            .ok_or_else(|| QueueError::ReservationLost(claim.id().clone()))?;
        state.next_dead_letter_id += 1;
        let dead_id = state.next_dead_letter_id;
        let record = DeadLetterRecord::new(JobId::from(dead_id), &job, reason, now);
        state.dead_letters.insert(dead_id, record.clone());
        Ok(record)
    }

    async fn counts(&self) -> Result<JobCounts> {
        let state = self.state();
        let active = state.jobs.values().filter(|job| job.is_reserved()).count() as u64;
        Ok(JobCounts {
            waiting: state.jobs.len() as u64 - active,
            active,
            completed: state.completed,
            failed: state.dead_letters.len() as u64,
        })
    }

    async fn release_stalled(&self, threshold: Duration) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let cutoff = now - chrono_duration(threshold);
        let mut state = self.state();
        let released: Vec<Job> = state
            .jobs
            .values_mut()
            .filter(|job| job.reserved_at().is_some_and(|at| at < cutoff))
            .map(|job| {
                job.release(now);
                job.clone()
            })
            .collect();
        if !released.is_empty() {
            debug!(count = released.len(), "Released stalled jobs");
        }
        Ok(released)
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        Ok(self
            .state()
            .jobs
            .values()
            .filter(|job| job.queue() == queue && !job.is_reserved())
            .count() as u64)
    }

    async fn clear(&self, queue: &str) -> Result<u64> {
        let mut state = self.state();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| job.queue() != queue || job.is_reserved());
        Ok((before - state.jobs.len()) as u64)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        Ok(self.state().dead_letters.values().cloned().collect())
    }

    async fn retry_dead_letter(&self, id: &JobId) -> Result<JobId> {
        let key = id
            .as_str()
            .parse::<u64>()
            .map_err(|_| QueueError::DeadLetterNotFound(id.clone()))?;
        let now = self.clock.now();
        let mut state = self.state();
        let record = state
            .dead_letters
            .remove(&key)
            .ok_or_else(|| QueueError::DeadLetterNotFound(id.clone()))?;
        Ok(state.insert(record.queue(), record.payload().clone(), now, now))
    }

    async fn forget_dead_letter(&self, id: &JobId) -> Result<bool> {
        let Ok(key) = id.as_str().parse::<u64>() else {
            return Ok(false);
        };
        Ok(self.state().dead_letters.remove(&key).is_some())
    }

    async fn flush_dead_letters(&self) -> Result<u64> {
        let mut state = self.state();
        let count = state.dead_letters.len() as u64;
        state.dead_letters.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::clock::mock::MockClock;

    fn driver() -> (Arc<MockClock>, MemoryDriver) {
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        (clock.clone(), MemoryDriver::new(clock))
    }

    fn payload(name: &str) -> JobPayload {
        JobPayload::new(name, json!({}))
    }

    #[tokio::test]
    async fn claim_respects_limit_queue_and_availability() {
        let (clock, driver) = driver();
        let now = clock.now();
        driver.enqueue("emails", &payload("A"), now).await.unwrap();
        driver.enqueue("emails", &payload("B"), now).await.unwrap();
        driver.enqueue("other", &payload("C"), now).await.unwrap();
        driver
            .enqueue("emails", &payload("Later"), now + chrono::Duration::seconds(30))
            .await
            .unwrap();

        let claimed = driver.claim_batch(Some("emails"), 10).await.unwrap();
        let names: Vec<&str> = claimed.iter().map(Job::name).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(claimed.iter().all(|job| *job.attempts() == 1));

        assert!(driver.claim_batch(Some("emails"), 10).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(30));
        let claimed = driver.claim_batch(None, 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].name(), "C");
        let claimed = driver.claim_batch(None, 5).await.unwrap();
        assert_eq!(claimed[0].name(), "Later");
    }

    #[tokio::test]
    async fn ack_release_and_dead_letter() {
        let (clock, driver) = driver();
        driver.enqueue("default", &payload("A"), clock.now()).await.unwrap();
        let first = driver.claim_batch(None, 1).await.unwrap().remove(0);

        let retry_at = clock.now() + chrono::Duration::seconds(5);
        driver.release(&first, retry_at).await.unwrap();
        assert!(driver.claim_batch(None, 1).await.unwrap().is_empty());
        clock.advance(chrono::Duration::seconds(5));
        let second = driver.claim_batch(None, 1).await.unwrap().remove(0);
        assert_eq!(*second.attempts(), 2);

        let record = driver.dead_letter(&second, "boom").await.unwrap();
        assert_eq!(*record.attempts(), 2);
        assert_eq!(record.exception(), "boom");
        assert_eq!(
            driver.counts().await.unwrap(),
            JobCounts {
                waiting: 0,
                active: 0,
                completed: 0,
                failed: 1
            }
        );
        assert!(matches!(
            driver.ack(&second).await,
            Err(QueueError::ReservationLost(_))
        ));

        let replayed = driver.retry_dead_letter(record.id()).await.unwrap();
        let job = driver.job(&replayed).unwrap();
        assert_eq!(*job.attempts(), 0);
        assert!(driver.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_jobs_are_released_once() {
        let (clock, driver) = driver();
        let id = driver.enqueue("default", &payload("A"), clock.now()).await.unwrap();
        driver.claim_batch(None, 1).await.unwrap();

        let threshold = Duration::from_secs(30 * 60);
        assert!(driver.release_stalled(threshold).await.unwrap().is_empty());

        clock.advance(chrono::Duration::minutes(31));
        let released = driver.release_stalled(threshold).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(*released[0].attempts(), 1);
        assert!(driver.release_stalled(threshold).await.unwrap().is_empty());

        let job = driver.job(&id).unwrap();
        assert!(!job.is_reserved());
        assert_eq!(*job.available_at(), clock.now());
    }

    #[tokio::test]
    async fn late_calls_from_a_recovered_claim_are_rejected() {
        let (clock, driver) = driver();
        let id = driver.enqueue("default", &payload("A"), clock.now()).await.unwrap();
        let stalled = driver.claim_batch(None, 1).await.unwrap().remove(0);

        clock.advance(chrono::Duration::minutes(31));
        let threshold = Duration::from_secs(30 * 60);
        assert_eq!(driver.release_stalled(threshold).await.unwrap().len(), 1);
        let current = driver.claim_batch(None, 1).await.unwrap().remove(0);
        assert_eq!(*current.attempts(), 2);

        assert!(matches!(
            driver.release(&stalled, clock.now()).await,
            Err(QueueError::ReservationLost(_))
        ));
        assert!(driver.claim_batch(None, 1).await.unwrap().is_empty());
        assert!(matches!(
            driver.ack(&stalled).await,
            Err(QueueError::ReservationLost(_))
        ));
        assert!(matches!(
            driver.dead_letter(&stalled, "late").await,
            Err(QueueError::ReservationLost(_))
        ));
        assert!(driver.job(&id).unwrap().is_held_by(&current));

        driver.ack(&current).await.unwrap();
        assert!(driver.job(&id).is_none());
    }

    #[tokio::test]
    async fn size_and_clear_skip_reserved_jobs() {
        let (clock, driver) = driver();
        for name in ["A", "B", "C"] {
            driver.enqueue("emails", &payload(name), clock.now()).await.unwrap();
        }
        driver.claim_batch(Some("emails"), 1).await.unwrap();
        assert_eq!(driver.size("emails").await.unwrap(), 2);
        assert_eq!(driver.clear("emails").await.unwrap(), 2);
        assert_eq!(driver.counts().await.unwrap().active, 1);
    }
}
