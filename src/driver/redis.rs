use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_job::{DeadLetterRecord, Job, JobId, JobPayload};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use tracing::{debug, info, warn};

use super::{chrono_duration, JobCounts, QueueDriver};
use crate::{
    clock::Clock,
    config::RedisConnectionConfig,
    errors::{QueueError, Result},
};

/// Moves up to `ARGV[2]` due ids from the queue sets (`KEYS[2..]`) to the reserved set
/// (`KEYS[1]`) in one step, so an id is handed to a single caller.
const CLAIM_SCRIPT: &str = r#"
local claimed = {}
local limit = tonumber(ARGV[2])
for i = 2, #KEYS do
    if #claimed >= limit then
        break
    end
    local ids = redis.call('ZRANGEBYSCORE', KEYS[i], '-inf', ARGV[1], 'LIMIT', 0, limit - #claimed)
    for _, id in ipairs(ids) do
        redis.call('ZREM', KEYS[i], id)
        redis.call('ZADD', KEYS[1], ARGV[1], id)
        table.insert(claimed, id)
    end
end
return claimed
"#;

/// Deletes a job still reserved under the claim, `ARGV[2]` being its reservation score.
/// KEYS: reserved set, jobs hash, completed counter.
const ACK_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) ~= tonumber(ARGV[2]) then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('INCR', KEYS[3])
return 1
"#;

/// Stores the released job (`ARGV[3]`) and queues it at `ARGV[4]` if still reserved under the claim.
/// KEYS: reserved set, jobs hash, queue set.
const RELEASE_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) ~= tonumber(ARGV[2]) then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
return 1
"#;

/// Moves a job still reserved under the claim to the failed hash as record `ARGV[3]` (`ARGV[4]`).
/// KEYS: reserved set, jobs hash, failed hash.
const DEAD_LETTER_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) ~= tonumber(ARGV[2]) then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[3], ARGV[4])
return 1
"#;

/// Reservation score a claim stamped on the reserved set
fn reservation_score(claim: &Job) -> Result<i64> {
    claim
        .reserved_at()
        .map(|at| at.timestamp_millis())
        .ok_or_else(|| QueueError::ReservationLost(claim.id().clone()))
}

/// Key layout under `prefix`
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    /// Sorted set of waiting ids, scored by `available_at` in milliseconds
    fn queue(&self, queue: &str) -> String {
        format!("{}:queue:{queue}", self.prefix)
    }

    fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    /// Hash of id to job json
    fn jobs(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    /// Sorted set of reserved ids, scored by `reserved_at` in milliseconds
    fn reserved(&self) -> String {
        format!("{}:reserved", self.prefix)
    }

    fn job_id(&self) -> String {
        format!("{}:id", self.prefix)
    }

    /// Hash of dead-letter id to record json
    fn failed(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    fn failed_id(&self) -> String {
        format!("{}:failed:id", self.prefix)
    }

    fn completed(&self) -> String {
        format!("{}:completed", self.prefix)
    }
}

/// Redis store built on sorted sets: one per queue for waiting jobs and one for reservations
pub struct RedisDriver {
    conn: ConnectionManager,
    keys: Keys,
    clock: Arc<dyn Clock>,
    claim_script: Script,
    ack_script: Script,
    release_script: Script,
    dead_letter_script: Script,
}

impl RedisDriver {
    pub async fn connect(config: &RedisConnectionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = redis::Client::open(config.connection_url())?;
        let conn = client.get_connection_manager().await?;
        info!(prefix = config.prefix, "Redis queue driver ready");
        Ok(Self::new(conn, &config.prefix, clock))
    }

    pub fn new(conn: ConnectionManager, prefix: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            keys: Keys {
                prefix: prefix.to_string(),
            },
            clock,
            claim_script: Script::new(CLAIM_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            dead_letter_script: Script::new(DEAD_LETTER_SCRIPT),
        }
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(self.keys.jobs(), id.as_str()).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(QueueError::from))
            .transpose()
    }

    async fn store(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(job)?;
        conn.hset::<_, _, _, ()>(self.keys.jobs(), job.id().as_str(), raw)
            .await?;
        Ok(())
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = conn.smembers(self.keys.queues()).await?;
        names.sort();
        Ok(names)
    }

    async fn insert(
        &self,
        queue: &str,
        payload: &JobPayload,
        available_at: DateTime<Utc>,
    ) -> Result<JobId> {
        let mut conn = self.conn.clone();
        let id: u64 = conn.incr(self.keys.job_id(), 1).await?;
        let job = Job::builder()
            .id(id)
            .queue(queue)
            .payload(payload.clone())
            .available_at(available_at)
            .created_at(self.clock.now())
            .build();

        redis::pipe()
            .atomic()
            .hset(self.keys.jobs(), id, serde_json::to_string(&job)?)
            .ignore()
            .sadd(self.keys.queues(), queue)
            .ignore()
            .zadd(self.keys.queue(queue), id, available_at.timestamp_millis())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(job.id().clone())
    }
}

#[async_trait]
impl QueueDriver for RedisDriver {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: &JobPayload,
        available_at: DateTime<Utc>,
    ) -> Result<JobId> {
        self.insert(queue, payload, available_at).await
    }

    async fn claim_batch(&self, queue: Option<&str>, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let queues = match queue {
            Some(queue) => vec![queue.to_string()],
            None => self.queue_names().await?,
        };
        if queues.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut invocation = self.claim_script.key(self.keys.reserved());
        for queue in &queues {
            invocation.key(self.keys.queue(queue));
        }
        invocation.arg(now.timestamp_millis()).arg(limit);

        let mut conn = self.conn.clone();
        let ids: Vec<String> = invocation.invoke_async(&mut conn).await?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids.into_iter().map(JobId::from) {
            let Some(mut job) = self.load(&id).await? else {
                warn!(job_id = %id, "Claimed id has no job data, dropping it");
                conn.zrem::<_, _, ()>(self.keys.reserved(), id.as_str()).await?;
                continue;
            };
            job.reserve(now);
            self.store(&job).await?;
            claimed.push(job);
        }
        Ok(claimed)
    }

    async fn ack(&self, claim: &Job) -> Result<()> {
        let score = reservation_score(claim)?;
        let mut conn = self.conn.clone();
        let acked: u64 = self
            .ack_script
            .key(self.keys.reserved())
            .key(self.keys.jobs())
            .key(self.keys.completed())
            .arg(claim.id().as_str())
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        if acked == 0 {
            return Err(QueueError::ReservationLost(claim.id().clone()));
        }
        Ok(())
    }

    async fn release(&self, claim: &Job, available_at: DateTime<Utc>) -> Result<()> {
        let score = reservation_score(claim)?;
        let mut job = claim.clone();
        job.release(available_at);

        let mut conn = self.conn.clone();
        let released: u64 = self
            .release_script
            .key(self.keys.reserved())
            .key(self.keys.jobs())
            .key(self.keys.queue(job.queue()))
            .arg(job.id().as_str())
            .arg(score)
            .arg(serde_json::to_string(&job)?)
            .arg(available_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            return Err(QueueError::ReservationLost(claim.id().clone()));
        }
        Ok(())
    }

    async fn dead_letter(&self, claim: &Job, reason: &str) -> Result<DeadLetterRecord> {
        let score = reservation_score(claim)?;
        let mut conn = self.conn.clone();
        let dead_id: u64 = conn.incr(self.keys.failed_id(), 1).await?;
        let record = DeadLetterRecord::new(JobId::from(dead_id), claim, reason, self.clock.now());

        let moved: u64 = self
            .dead_letter_script
            .key(self.keys.reserved())
            .key(self.keys.jobs())
            .key(self.keys.failed())
            .arg(claim.id().as_str())
            .arg(score)
            .arg(dead_id)
            .arg(serde_json::to_string(&record)?)
            .invoke_async(&mut conn)
            .await?;
        if moved == 0 {
            return Err(QueueError::ReservationLost(claim.id().clone()));
        }
        Ok(record)
    }

    async fn counts(&self) -> Result<JobCounts> {
        let mut conn = self.conn.clone();
        let mut waiting = 0;
        for queue in self.queue_names().await? {
            let size: u64 = conn.zcard(self.keys.queue(&queue)).await?;
            waiting += size;
        }
        let active: u64 = conn.zcard(self.keys.reserved()).await?;
        let completed: Option<u64> = conn.get(self.keys.completed()).await?;
        let failed: u64 = conn.hlen(self.keys.failed()).await?;
        Ok(JobCounts {
            waiting,
            active,
            completed: completed.unwrap_or(0),
            failed,
        })
    }

    async fn release_stalled(&self, threshold: Duration) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let cutoff = (now - chrono_duration(threshold)).timestamp_millis();
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys.reserved(), "-inf", format!("({cutoff}"))
            .await?;

        let mut released = Vec::new();
        for id in ids.into_iter().map(JobId::from) {
            // ZREM is the claim on the recovery, a concurrent sweep gets 0 back
            let removed: u64 = conn.zrem(self.keys.reserved(), id.as_str()).await?;
            if removed == 0 {
                continue;
            }
            let Some(mut job) = self.load(&id).await? else {
                continue;
            };
            job.release(now);
            redis::pipe()
                .atomic()
                .hset(self.keys.jobs(), id.as_str(), serde_json::to_string(&job)?)
                .ignore()
                .zadd(self.keys.queue(job.queue()), id.as_str(), now.timestamp_millis())
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
            released.push(job);
        }
        if !released.is_empty() {
            debug!(count = released.len(), "Released stalled jobs");
        }
        Ok(released)
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(self.keys.queue(queue)).await?)
    }

    async fn clear(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(self.keys.queue(queue), 0, -1).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        redis::pipe()
            .atomic()
            .hdel(self.keys.jobs(), &ids)
            .ignore()
            .del(self.keys.queue(queue))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(ids.len() as u64)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(self.keys.failed()).await?;
        let mut records = raw
            .iter()
            .map(|raw| serde_json::from_str::<DeadLetterRecord>(raw))
            .collect::<serde_json::Result<Vec<_>>>()?;
        records.sort_by(|a, b| (a.failed_at(), a.id()).cmp(&(b.failed_at(), b.id())));
        Ok(records)
    }

    async fn retry_dead_letter(&self, id: &JobId) -> Result<JobId> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(self.keys.failed(), id.as_str()).await?;
        let record: DeadLetterRecord = serde_json::from_str(
            &raw.ok_or_else(|| QueueError::DeadLetterNotFound(id.clone()))?,
        )?;
        let removed: u64 = conn.hdel(self.keys.failed(), id.as_str()).await?;
        if removed == 0 {
            return Err(QueueError::DeadLetterNotFound(id.clone()));
        }
        self.insert(record.queue(), record.payload(), self.clock.now())
            .await
    }

    async fn forget_dead_letter(&self, id: &JobId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.hdel(self.keys.failed(), id.as_str()).await?;
        Ok(removed > 0)
    }

    async fn flush_dead_letters(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.hlen(self.keys.failed()).await?;
        conn.del::<_, ()>(self.keys.failed()).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        let keys = Keys {
            prefix: "queues".into(),
        };
        assert_eq!(keys.queue("emails"), "queues:queue:emails");
        assert_eq!(keys.reserved(), "queues:reserved");
        assert_eq!(keys.failed_id(), "queues:failed:id");
    }
}
