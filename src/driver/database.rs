use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indoc::formatdoc;
use jobqueue_job::{DeadLetterRecord, Job, JobId, JobPayload};
use jobqueue_migrations::migrate;
use sqlx::{
    postgres::PgPoolOptions, query, query_as, query_scalar, Executor, FromRow, PgPool, Postgres,
};
use tracing::{debug, info};

use super::{chrono_duration, JobCounts, QueueDriver};
use crate::{
    clock::Clock,
    config::DatabaseConnectionConfig,
    errors::{QueueError, Result},
};

pub(crate) async fn escape_identifier<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    identifier: &str,
) -> Result<String> {
    let escaped_identifier: String = query_scalar("select format('%I', $1::text)")
        .bind(identifier)
        .fetch_one(executor)
        .await?;

    Ok(escaped_identifier)
}

#[derive(FromRow, Debug)]
struct JobRow {
    id: i64,
    queue: String,
    payload: String,
    attempts: i32,
    reserved_at: Option<DateTime<Utc>>,
    available_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        let payload = JobPayload::from_json_str(&row.payload)?;
        let mut builder = Job::builder()
            .id(row.id)
            .queue(row.queue)
            .payload(payload)
            .attempts(row.attempts.max(0) as u32)
            .available_at(row.available_at)
            .created_at(row.created_at);
        if let Some(reserved_at) = row.reserved_at {
            builder = builder.reserved_at(reserved_at);
        }
        Ok(builder.build())
    }
}

#[derive(FromRow, Debug)]
struct FailedJobRow {
    id: i64,
    job_id: i64,
    queue: String,
    payload: String,
    exception: String,
    attempts: i32,
    failed_at: DateTime<Utc>,
}

impl TryFrom<FailedJobRow> for DeadLetterRecord {
    type Error = QueueError;

    fn try_from(row: FailedJobRow) -> Result<Self> {
        Ok(DeadLetterRecord::from_parts(
            JobId::from(row.id),
            JobId::from(row.job_id),
            row.queue,
            JobPayload::from_json_str(&row.payload)?,
            row.exception,
            row.failed_at,
            row.attempts.max(0) as u32,
        ))
    }
}

fn parse_id(id: &JobId) -> Result<i64> {
    id.as_str()
        .parse()
        .map_err(|_| QueueError::JobNotFound(id.clone()))
}

fn parse_dead_letter_id(id: &JobId) -> Result<i64> {
    id.as_str()
        .parse()
        .map_err(|_| QueueError::DeadLetterNotFound(id.clone()))
}

/// PostgreSQL store. Claims lock rows with `for update skip locked` so concurrent
/// workers never reserve the same job.
pub struct DatabaseDriver {
    pool: PgPool,
    escaped_schema: String,
    clock: Arc<dyn Clock>,
    completed: AtomicU64,
}

impl DatabaseDriver {
    /// Connects, then installs or upgrades the schema
    pub async fn connect(config: &DatabaseConnectionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Self::from_pool(pool, &config.schema, clock).await
    }

    /// Uses an existing pool, installing or upgrading the schema
    pub async fn from_pool(pool: PgPool, schema: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let escaped_schema = escape_identifier(&pool, schema).await?;
        migrate(&pool, &escaped_schema).await?;
        info!(schema, "Database queue driver ready");
        Ok(Self {
            pool,
            escaped_schema,
            clock,
            completed: AtomicU64::new(0),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn escaped_schema(&self) -> &str {
        &self.escaped_schema
    }
}

#[async_trait]
impl QueueDriver for DatabaseDriver {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: &JobPayload,
        available_at: DateTime<Utc>,
    ) -> Result<JobId> {
        let sql = formatdoc!(
            r#"
                insert into {escaped_schema}.jobs (queue, payload, attempts, available_at, created_at)
                values ($1, $2, 0, $3, $4)
                returning id
            "#,
            escaped_schema = self.escaped_schema
        );
        let id: i64 = query_scalar(&sql)
            .bind(queue)
            .bind(payload.to_json_string()?)
            .bind(available_at)
            .bind(self.clock.now())
            .fetch_one(&self.pool)
            .await?;
        Ok(JobId::from(id))
    }

    async fn claim_batch(&self, queue: Option<&str>, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = formatdoc!(
            r#"
                with j as (
                    select id
                        from {escaped_schema}.jobs
                        where reserved_at is null
                        and available_at <= $1
                        and ($2::text is null or queue = $2::text)
                        order by available_at asc, id asc
                        limit $3
                        for update
                        skip locked
                )
                update {escaped_schema}.jobs as jobs
                    set
                        attempts = jobs.attempts + 1,
                        reserved_at = $1
                    from j
                    where jobs.id = j.id
                    returning jobs.*
            "#,
            escaped_schema = self.escaped_schema
        );
        let rows: Vec<JobRow> = query_as(&sql)
            .bind(self.clock.now())
            .bind(queue)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>>>()?;
        jobs.sort_by(|a, b| a.available_at().cmp(b.available_at()));
        Ok(jobs)
    }

    async fn ack(&self, claim: &Job) -> Result<()> {
        let sql = formatdoc!(
            r#"
                delete from {escaped_schema}.jobs
                    where id = $1
                    and attempts = $2
                    and reserved_at is not null
            "#,
            escaped_schema = self.escaped_schema
        );
        let result = query(&sql)
            .bind(parse_id(claim.id())?)
            .bind(*claim.attempts() as i32)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::ReservationLost(claim.id().clone()));
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn release(&self, claim: &Job, available_at: DateTime<Utc>) -> Result<()> {
        let sql = formatdoc!(
            r#"
                update {escaped_schema}.jobs
                    set reserved_at = null, available_at = $3
                    where id = $1
                    and attempts = $2
                    and reserved_at is not null
            "#,
            escaped_schema = self.escaped_schema
        );
        let result = query(&sql)
            .bind(parse_id(claim.id())?)
            .bind(*claim.attempts() as i32)
            .bind(available_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::ReservationLost(claim.id().clone()));
        }
        Ok(())
    }

    async fn dead_letter(&self, claim: &Job, reason: &str) -> Result<DeadLetterRecord> {
        let sql = formatdoc!(
            r#"
                with moved as (
                    delete from {escaped_schema}.jobs
                        where id = $1
                        and attempts = $2
                        and reserved_at is not null
                        returning id, queue, payload, attempts
                )
                insert into {escaped_schema}.failed_jobs (job_id, queue, payload, exception, attempts, failed_at)
                    select id, queue, payload, $3, attempts, $4 from moved
                    returning *
            "#,
            escaped_schema = self.escaped_schema
        );
        let row: Option<FailedJobRow> = query_as(&sql)
            .bind(parse_id(claim.id())?)
            .bind(*claim.attempts() as i32)
            .bind(reason)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| QueueError::ReservationLost(claim.id().clone()))?
            .try_into()
    }

    async fn counts(&self) -> Result<JobCounts> {
        let sql = formatdoc!(
            r#"
                select
                    (select count(*) from {escaped_schema}.jobs where reserved_at is null) as waiting,
                    (select count(*) from {escaped_schema}.jobs where reserved_at is not null) as active,
                    (select count(*) from {escaped_schema}.failed_jobs) as failed
            "#,
            escaped_schema = self.escaped_schema
        );
        let (waiting, active, failed): (i64, i64, i64) =
            query_as(&sql).fetch_one(&self.pool).await?;
        Ok(JobCounts {
            waiting: waiting as u64,
            active: active as u64,
            completed: self.completed.load(Ordering::Relaxed),
            failed: failed as u64,
        })
    }

    async fn release_stalled(&self, threshold: Duration) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let sql = formatdoc!(
            r#"
                update {escaped_schema}.jobs
                    set reserved_at = null, available_at = $2
                    where reserved_at is not null
                    and reserved_at < $1
                    returning *
            "#,
            escaped_schema = self.escaped_schema
        );
        let rows: Vec<JobRow> = query_as(&sql)
            .bind(now - chrono_duration(threshold))
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        if !rows.is_empty() {
            debug!(count = rows.len(), "Released stalled jobs");
        }
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        let sql = formatdoc!(
            r#"
                select count(*) from {escaped_schema}.jobs
                    where queue = $1 and reserved_at is null
            "#,
            escaped_schema = self.escaped_schema
        );
        let count: i64 = query_scalar(&sql).bind(queue).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn clear(&self, queue: &str) -> Result<u64> {
        let sql = formatdoc!(
            r#"
                delete from {escaped_schema}.jobs
                    where queue = $1 and reserved_at is null
            "#,
            escaped_schema = self.escaped_schema
        );
        let result = query(&sql).bind(queue).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        let sql = formatdoc!(
            r#"
                select * from {escaped_schema}.failed_jobs order by failed_at asc, id asc
            "#,
            escaped_schema = self.escaped_schema
        );
        let rows: Vec<FailedJobRow> = query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(DeadLetterRecord::try_from).collect()
    }

    async fn retry_dead_letter(&self, id: &JobId) -> Result<JobId> {
        let sql = formatdoc!(
            r#"
                with moved as (
                    delete from {escaped_schema}.failed_jobs
                        where id = $1
                        returning queue, payload
                )
                insert into {escaped_schema}.jobs (queue, payload, attempts, available_at, created_at)
                    select queue, payload, 0, $2, $2 from moved
                    returning id
            "#,
            escaped_schema = self.escaped_schema
        );
        let new_id: Option<i64> = query_scalar(&sql)
            .bind(parse_dead_letter_id(id)?)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await?;
        new_id
            .map(JobId::from)
            .ok_or_else(|| QueueError::DeadLetterNotFound(id.clone()))
    }

    async fn forget_dead_letter(&self, id: &JobId) -> Result<bool> {
        let Ok(key) = parse_dead_letter_id(id) else {
            return Ok(false);
        };
        let sql = formatdoc!(
            r#"
                delete from {escaped_schema}.failed_jobs where id = $1
            "#,
            escaped_schema = self.escaped_schema
        );
        let result = query(&sql).bind(key).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn flush_dead_letters(&self) -> Result<u64> {
        let sql = formatdoc!(
            r#"
                delete from {escaped_schema}.failed_jobs
            "#,
            escaped_schema = self.escaped_schema
        );
        let result = query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
