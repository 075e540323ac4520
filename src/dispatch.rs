use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use derive_builder::Builder;
use futures::{future::BoxFuture, FutureExt};
use getset::Getters;
use jobqueue_backoff::Backoff;
use jobqueue_events::QueueEvent;
use jobqueue_job::{
    ChainedJob, DeadLetterRecord, JobId, JobOptions, JobPayload, DEFAULT_QUEUE,
    DEFAULT_TIMEOUT_SECONDS, DEFAULT_TRIES,
};
use jobqueue_task_handler::TaskHandler;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{
    config::{ConnectionConfig, QueueConfig},
    context::QueueContext,
    driver::{
        add_duration, DatabaseDriver, JobCounts, MemoryDriver, QueueDriver, RedisDriver,
        SyncDriver,
    },
    errors::{QueueError, Result},
};

/// How a single dispatch should be handled.
///
/// Unset retry fields fall back to the job's registered configuration, then to the
/// queue defaults (3 tries, 60 seconds timeout, 10 seconds between attempts).
///
/// ```
/// use jobqueue::DispatchOptions;
///
/// let options = DispatchOptions::builder()
///     .queue("emails")
///     .delay_seconds(30)
///     .tries(5)
///     .backoff(vec![1.0, 2.0, 4.0])
///     .build();
/// assert_eq!(options.queue(), &Some("emails".to_string()));
/// ```
#[derive(Getters, Debug, Default, Clone, PartialEq, Builder)]
#[getset(get = "pub")]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(strip_option),
    default,
    pattern = "owned"
)]
pub struct DispatchOptions {
    /// Connection to dispatch on, the default connection when unset
    #[builder(setter(into))]
    connection: Option<String>,
    #[builder(setter(into))]
    queue: Option<String>,
    /// The job is not claimable before this many seconds have passed
    delay_seconds: Option<u64>,
    tries: Option<u32>,
    /// Handler timeout in seconds
    timeout_seconds: Option<u64>,
    #[builder(setter(into))]
    backoff: Option<Backoff>,
    /// Enqueued one after another once this job succeeds
    #[builder(setter(custom))]
    chain: Vec<ChainedJob>,
    /// Buffer the dispatch until [`Queue::flush_deferred`]
    #[builder(setter(custom))]
    run_after_response: bool,
    /// Run the handler inline instead of queueing
    #[builder(setter(custom))]
    run_synchronously: bool,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> DispatchOptionsBuilder {
        DispatchOptionsBuilder::default()
    }
}

impl DispatchOptionsBuilder {
    pub fn chain(mut self, chain: Vec<ChainedJob>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn run_after_response(mut self) -> Self {
        self.run_after_response = Some(true);
        self
    }

    pub fn run_synchronously(mut self) -> Self {
        self.run_synchronously = Some(true);
        self
    }

    pub fn build(self) -> DispatchOptions {
        self.build_internal()
            .expect("There is a default value for all fields")
    }
}

/// What happened to a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Persisted, a processor will run it
    Queued,
    /// Ran inline and succeeded
    Completed,
    /// Buffered until [`Queue::flush_deferred`]
    Deferred,
}

/// Returned by every dispatch
#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct JobHandle {
    /// Absent for deferred dispatches
    id: Option<JobId>,
    name: String,
    connection: String,
    queue: String,
    status: DispatchStatus,
}

impl JobHandle {
    pub(crate) fn new(
        id: Option<JobId>,
        name: impl Into<String>,
        connection: impl Into<String>,
        queue: impl Into<String>,
        status: DispatchStatus,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            connection: connection.into(),
            queue: queue.into(),
            status,
        }
    }
}

/// Entry point of producers.
///
/// Code that enqueues work holds a `Dispatch` implementation, the real [`Queue`] or a
/// [`crate::testing::FakeQueue`] in tests.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, name: &str, data: Value, options: DispatchOptions)
        -> Result<JobHandle>;

    /// Dispatches the typed task `T` under its identifier
    async fn dispatch_task<T: TaskHandler>(
        &self,
        task: T,
        options: DispatchOptions,
    ) -> Result<JobHandle>
    where
        Self: Sized,
    {
        let data = serde_json::to_value(&task)?;
        self.dispatch(T::IDENTIFIER, data, options).await
    }
}

#[derive(Clone)]
struct Connection {
    driver: Arc<dyn QueueDriver>,
    default_queue: Option<String>,
}

struct Deferred {
    name: String,
    data: Value,
    options: DispatchOptions,
}

struct QueueInner {
    ctx: QueueContext,
    connections: RwLock<BTreeMap<String, Connection>>,
    default_connection: RwLock<String>,
    deferred: Mutex<Vec<Deferred>>,
}

/// Dispatch facade over named connections, each backed by one driver
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("connections", &self.connection_names())
            .field("default_connection", &self.default_connection())
            .finish()
    }
}

impl Queue {
    /// Facade without connections, `default_connection` names the one used when a
    /// dispatch does not pick one
    pub fn new(ctx: QueueContext, default_connection: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                ctx,
                connections: RwLock::new(BTreeMap::new()),
                default_connection: RwLock::new(default_connection.into()),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    /// `memory` (default) and `sync` connections
    pub fn in_memory(ctx: QueueContext) -> Self {
        let queue = Self::new(ctx.clone(), "memory");
        queue.add_connection("memory", Arc::new(MemoryDriver::new(ctx.clock().clone())), None);
        queue.add_connection("sync", Arc::new(SyncDriver::new(ctx)), None);
        queue
    }

    /// Builds every configured connection, connecting and migrating stores as needed
    pub async fn from_config(config: &QueueConfig, ctx: QueueContext) -> Result<Self> {
        if !config.connections.contains_key(&config.default) {
            return Err(QueueError::InvalidConfig(format!(
                "default connection `{}` is not configured",
                config.default
            )));
        }

        let queue = Self::new(ctx.clone(), config.default.clone());
        for (name, connection) in &config.connections {
            let driver: Arc<dyn QueueDriver> = match connection {
                ConnectionConfig::Sync { .. } => Arc::new(SyncDriver::new(ctx.clone())),
                ConnectionConfig::Memory { .. } => {
                    Arc::new(MemoryDriver::new(ctx.clock().clone()))
                }
                ConnectionConfig::Database(db) => {
                    Arc::new(DatabaseDriver::connect(db, ctx.clock().clone()).await?)
                }
                ConnectionConfig::Redis(redis) => {
                    Arc::new(RedisDriver::connect(redis, ctx.clock().clone()).await?)
                }
            };
            info!(connection = name, driver = driver.name(), "Queue connection ready");
            queue.add_connection(name, driver, connection.default_queue().map(str::to_string));
        }
        Ok(queue)
    }

    pub fn with_connection(self, name: impl Into<String>, driver: Arc<dyn QueueDriver>) -> Self {
        self.add_connection(name, driver, None);
        self
    }

    pub fn add_connection(
        &self,
        name: impl Into<String>,
        driver: Arc<dyn QueueDriver>,
        default_queue: Option<String>,
    ) {
        self.inner
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                name.into(),
                Connection {
                    driver,
                    default_queue,
                },
            );
    }

    pub fn context(&self) -> &QueueContext {
        &self.inner.ctx
    }

    pub fn default_connection(&self) -> String {
        self.inner
            .default_connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_default_connection(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.lookup(&name)?;
        *self
            .inner
            .default_connection
            .write()
            .unwrap_or_else(|e| e.into_inner()) = name;
        Ok(())
    }

    pub fn connection_names(&self) -> Vec<String> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn lookup(&self, name: &str) -> Result<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::DriverNotConfigured(name.to_string()))
    }

    fn resolve(&self, connection: Option<&str>) -> Result<(String, Connection)> {
        let name = connection
            .map(str::to_string)
            .unwrap_or_else(|| self.default_connection());
        let connection = self.lookup(&name)?;
        Ok((name, connection))
    }

    /// Driver behind the connection `name`
    pub fn connection(&self, name: &str) -> Result<Arc<dyn QueueDriver>> {
        Ok(self.lookup(name)?.driver)
    }

    /// Applies the job's registered defaults then the queue defaults to unset options
    fn job_options(&self, name: &str, options: &DispatchOptions) -> JobOptions {
        let config = self.inner.ctx.registry().config(name);
        let tries = options
            .tries
            .or_else(|| config.and_then(|c| *c.tries()))
            .unwrap_or(DEFAULT_TRIES);
        let timeout = options
            .timeout_seconds
            .or_else(|| config.and_then(|c| *c.timeout()))
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let backoff = options
            .backoff
            .clone()
            .or_else(|| config.and_then(|c| c.backoff().clone()));
        JobOptions::new(tries, timeout, backoff)
    }

    /// Persists `payload` on a connection, or runs it when the connection is inline
    pub(crate) async fn push_payload(
        &self,
        connection: Option<&str>,
        queue: Option<&str>,
        payload: JobPayload,
        delay: Duration,
    ) -> Result<JobHandle> {
        let (connection_name, connection) = self.resolve(connection)?;
        let queue = queue
            .map(str::to_string)
            .or_else(|| {
                self.inner
                    .ctx
                    .registry()
                    .config(payload.name())
                    .and_then(|c| c.queue().clone())
            })
            .or_else(|| connection.default_queue.clone())
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());

        self.push_on_driver(&connection_name, connection.driver, &queue, payload, delay)
            .await
    }

    async fn push_on_driver(
        &self,
        connection_name: &str,
        driver: Arc<dyn QueueDriver>,
        queue: &str,
        payload: JobPayload,
        delay: Duration,
    ) -> Result<JobHandle> {
        let ctx = &self.inner.ctx;
        let available_at = add_duration(ctx.now(), delay);
        let name = payload.name().clone();
        let id = driver.enqueue(queue, &payload, available_at).await?;

        if driver.runs_inline() {
            debug!(job_id = %id, job_name = name, "Job ran inline");
            if let Some(next) = payload.next_in_chain() {
                self.dispatch_chained(next).await?;
            }
            return Ok(JobHandle::new(
                Some(id),
                name,
                connection_name,
                queue,
                DispatchStatus::Completed,
            ));
        }

        ctx.emit(QueueEvent::JobAdded, |p| {
            let p = p
                .with_job_id(id.as_str())
                .with_job_name(name.as_str())
                .with_queue_name(queue)
                .with_data(payload.data().clone());
            if delay.is_zero() {
                p
            } else {
                p.with_delay(delay)
            }
        })
        .await;

        Ok(JobHandle::new(
            Some(id),
            name,
            connection_name,
            queue,
            DispatchStatus::Queued,
        ))
    }

    /// Enqueues the next link of a chain. Boxed, an inline link dispatches the one after it.
    pub(crate) fn dispatch_chained(&self, chained: ChainedJob) -> BoxFuture<'_, Result<JobHandle>> {
        async move {
            let delay = Duration::from_secs(chained.delay().unwrap_or(0));
            let connection = chained.connection().clone();
            let queue = chained.queue().clone();
            self.push_payload(
                connection.as_deref(),
                queue.as_deref(),
                chained.into_payload(),
                delay,
            )
            .await
        }
        .boxed()
    }

    /// Same as [`Dispatch::dispatch`]
    pub async fn enqueue(
        &self,
        name: &str,
        data: Value,
        options: DispatchOptions,
    ) -> Result<JobHandle> {
        let (connection_name, _) = self.resolve(options.connection.as_deref())?;
        let queue_hint = options.queue.clone().unwrap_or_default();

        if options.run_after_response {
            let mut options = options;
            options.run_after_response = false;
            debug!(job_name = name, "Deferring dispatch");
            self.deferred().push(Deferred {
                    name: name.to_string(),
                    data,
                    options,
                });
            return Ok(JobHandle::new(
                None,
                name,
                connection_name,
                queue_hint,
                DispatchStatus::Deferred,
            ));
        }

        let payload = JobPayload::new(name, data)
            .with_options(self.job_options(name, &options))
            .with_chain(options.chain.clone());
        let delay = Duration::from_secs(options.delay_seconds.unwrap_or(0));

        if options.run_synchronously {
            let inline: Arc<dyn QueueDriver> = Arc::new(SyncDriver::new(self.inner.ctx.clone()));
            let queue = options.queue.as_deref().unwrap_or(DEFAULT_QUEUE);
            return self
                .push_on_driver(&connection_name, inline, queue, payload, Duration::ZERO)
                .await;
        }

        self.push_payload(Some(&connection_name), options.queue.as_deref(), payload, delay)
            .await
    }

    /// Enqueues on `queue` of the default connection
    pub async fn push_on(&self, queue: &str, name: &str, data: Value) -> Result<JobHandle> {
        self.enqueue(name, data, DispatchOptions::builder().queue(queue).build())
            .await
    }

    /// Enqueues, claimable once `delay` has passed
    pub async fn later(&self, delay: Duration, name: &str, data: Value) -> Result<JobHandle> {
        let options = DispatchOptions::builder()
            .delay_seconds(delay.as_secs())
            .build();
        self.enqueue(name, data, options).await
    }

    /// Enqueues every `(name, data)` pair with the same options, stopping at the first error
    pub async fn bulk(
        &self,
        jobs: Vec<(String, Value)>,
        options: DispatchOptions,
    ) -> Result<Vec<JobHandle>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for (name, data) in jobs {
            handles.push(self.enqueue(&name, data, options.clone()).await?);
        }
        Ok(handles)
    }

    /// Persists every deferred dispatch, in dispatch order.
    ///
    /// Stops at the first store error. The failed dispatch and the ones after it stay
    /// buffered, ahead of anything deferred since, so a later flush picks them up.
    pub async fn flush_deferred(&self) -> Result<Vec<JobHandle>> {
        let deferred: Vec<Deferred> = std::mem::take(&mut *self.deferred());
        let mut handles = Vec::with_capacity(deferred.len());
        let mut pending = deferred.into_iter();
        while let Some(job) = pending.next() {
            match self
                .enqueue(&job.name, job.data.clone(), job.options.clone())
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    let restored: Vec<Deferred> = std::iter::once(job).chain(pending).collect();
                    error!(
                        error = %e,
                        flushed = handles.len(),
                        kept = restored.len(),
                        "Could not flush deferred dispatches"
                    );
                    let mut buffer = self.deferred();
                    let newer = std::mem::replace(&mut *buffer, restored);
                    buffer.extend(newer);
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    fn deferred(&self) -> MutexGuard<'_, Vec<Deferred>> {
        self.inner
            .deferred
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Drops deferred dispatches, returning how many there were
    pub fn discard_deferred(&self) -> usize {
        let mut deferred = self.deferred();
        let count = deferred.len();
        deferred.clear();
        count
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred().len()
    }

    /// Waiting jobs of `queue` on the default connection
    pub async fn size(&self, queue: &str) -> Result<u64> {
        self.resolve(None)?.1.driver.size(queue).await
    }

    /// Deletes the waiting jobs of `queue` on the default connection
    pub async fn clear(&self, queue: &str) -> Result<u64> {
        self.resolve(None)?.1.driver.clear(queue).await
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        self.resolve(None)?.1.driver.counts().await
    }

    pub async fn failed_jobs(&self, connection: Option<&str>) -> Result<Vec<DeadLetterRecord>> {
        self.resolve(connection)?.1.driver.dead_letters().await
    }

    /// Puts a dead-lettered job back in its queue with no attempts
    pub async fn retry_failed_job(&self, connection: Option<&str>, id: &JobId) -> Result<JobId> {
        let driver = self.resolve(connection)?.1.driver;
        let new_id = driver.retry_dead_letter(id).await?;
        info!(failed_id = %id, job_id = %new_id, "Retrying failed job");
        Ok(new_id)
    }

    /// Retries every dead-lettered job, returning how many were requeued
    pub async fn retry_all_failed_jobs(&self, connection: Option<&str>) -> Result<usize> {
        let driver = self.resolve(connection)?.1.driver;
        let records = driver.dead_letters().await?;
        let mut retried = 0;
        for record in records {
            match driver.retry_dead_letter(record.id()).await {
                Ok(_) => retried += 1,
                // Replayed by someone else in the meantime
                Err(QueueError::DeadLetterNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(retried)
    }

    pub async fn forget_failed_job(&self, connection: Option<&str>, id: &JobId) -> Result<bool> {
        self.resolve(connection)?.1.driver.forget_dead_letter(id).await
    }

    pub async fn flush_failed_jobs(&self, connection: Option<&str>) -> Result<u64> {
        self.resolve(connection)?.1.driver.flush_dead_letters().await
    }
}

#[async_trait]
impl Dispatch for Queue {
    async fn dispatch(
        &self,
        name: &str,
        data: Value,
        options: DispatchOptions,
    ) -> Result<JobHandle> {
        self.enqueue(name, data, options).await
    }
}

#[cfg(test)]
mod tests {
    use jobqueue_task_handler::{HandlerRegistry, JobConfig, JobModule};
    use serde_json::json;

    use super::*;

    fn queue() -> Queue {
        let registry = HandlerRegistry::new().define(
            "Configured",
            JobModule::new()
                .handle(|_| async {})
                .with_config(JobConfig::new().on_queue("reports").with_tries(7)),
        );
        Queue::in_memory(QueueContext::new(registry))
    }

    #[tokio::test]
    async fn unknown_connection_is_a_configuration_error() {
        let queue = queue();
        let err = queue
            .enqueue(
                "Anything",
                json!({}),
                DispatchOptions::builder().connection("nowhere").build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DriverNotConfigured(name) if name == "nowhere"));
        assert!(queue.set_default_connection("nowhere").is_err());
    }

    #[tokio::test]
    async fn job_config_fills_unset_options() {
        let queue = queue();
        let handle = queue
            .enqueue("Configured", json!({}), DispatchOptions::new())
            .await
            .unwrap();
        assert_eq!(handle.queue(), "reports");
        assert_eq!(handle.status(), &DispatchStatus::Queued);

        let driver = queue.connection("memory").unwrap();
        let jobs = driver.claim_batch(Some("reports"), 1).await.unwrap();
        assert_eq!(jobs[0].max_tries(), 7);
        assert_eq!(jobs[0].timeout(), Duration::from_secs(60));

        let handle = queue
            .enqueue(
                "Configured",
                json!({}),
                DispatchOptions::builder().queue("urgent").tries(1).build(),
            )
            .await
            .unwrap();
        assert_eq!(handle.queue(), "urgent");
    }

    #[tokio::test]
    async fn deferred_dispatches_wait_for_flush() {
        let queue = queue();
        let handle = queue
            .enqueue(
                "Configured",
                json!({"n": 1}),
                DispatchOptions::builder().run_after_response().build(),
            )
            .await
            .unwrap();
        assert_eq!(handle.status(), &DispatchStatus::Deferred);
        assert!(handle.id().is_none());
        assert_eq!(queue.counts().await.unwrap().waiting, 0);

        let handles = queue.flush_deferred().await.unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(queue.counts().await.unwrap().waiting, 1);

        queue
            .enqueue(
                "Configured",
                json!({}),
                DispatchOptions::builder().run_after_response().build(),
            )
            .await
            .unwrap();
        assert_eq!(queue.discard_deferred(), 1);
        assert!(queue.flush_deferred().await.unwrap().is_empty());
    }

    /// Memory store whose enqueue fails while `down` is set
    struct FlakyStore {
        inner: MemoryDriver,
        down: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn set_down(&self, down: bool) {
            self.down.store(down, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl QueueDriver for FlakyStore {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn enqueue(
            &self,
            queue: &str,
            payload: &JobPayload,
            available_at: chrono::DateTime<chrono::Utc>,
        ) -> Result<JobId> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(QueueError::InvalidConfig("store unavailable".to_string()));
            }
            self.inner.enqueue(queue, payload, available_at).await
        }

        async fn claim_batch(&self, queue: Option<&str>, limit: usize) -> Result<Vec<jobqueue_job::Job>> {
            self.inner.claim_batch(queue, limit).await
        }

        async fn ack(&self, claim: &jobqueue_job::Job) -> Result<()> {
            self.inner.ack(claim).await
        }

        async fn release(
            &self,
            claim: &jobqueue_job::Job,
            available_at: chrono::DateTime<chrono::Utc>,
        ) -> Result<()> {
            self.inner.release(claim, available_at).await
        }

        async fn dead_letter(&self, claim: &jobqueue_job::Job, reason: &str) -> Result<DeadLetterRecord> {
            self.inner.dead_letter(claim, reason).await
        }

        async fn counts(&self) -> Result<JobCounts> {
            self.inner.counts().await
        }

        async fn release_stalled(&self, threshold: Duration) -> Result<Vec<jobqueue_job::Job>> {
            self.inner.release_stalled(threshold).await
        }

        async fn size(&self, queue: &str) -> Result<u64> {
            self.inner.size(queue).await
        }

        async fn clear(&self, queue: &str) -> Result<u64> {
            self.inner.clear(queue).await
        }

        async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
            self.inner.dead_letters().await
        }

        async fn retry_dead_letter(&self, id: &JobId) -> Result<JobId> {
            self.inner.retry_dead_letter(id).await
        }

        async fn forget_dead_letter(&self, id: &JobId) -> Result<bool> {
            self.inner.forget_dead_letter(id).await
        }

        async fn flush_dead_letters(&self) -> Result<u64> {
            self.inner.flush_dead_letters().await
        }
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_remaining_dispatches() {
        let ctx = QueueContext::new(HandlerRegistry::new());
        let store = Arc::new(FlakyStore {
            inner: MemoryDriver::new(ctx.clock().clone()),
            down: Default::default(),
        });
        let queue = Queue::in_memory(ctx).with_connection("flaky", store.clone());
        let deferred = |n: u64| {
            let queue = queue.clone();
            async move {
                queue
                    .enqueue(
                        "Report",
                        json!({ "n": n }),
                        DispatchOptions::builder()
                            .connection("flaky")
                            .run_after_response()
                            .build(),
                    )
                    .await
                    .unwrap();
            }
        };
        for n in 1..=3 {
            deferred(n).await;
        }

        store.set_down(true);
        assert!(queue.flush_deferred().await.is_err());
        assert_eq!(queue.deferred_count(), 3);

        deferred(4).await;
        store.set_down(false);
        let handles = queue.flush_deferred().await.unwrap();
        assert_eq!(handles.len(), 4);
        assert_eq!(queue.deferred_count(), 0);

        let jobs = store.claim_batch(None, 10).await.unwrap();
        let order: Vec<u64> = jobs
            .iter()
            .map(|job| job.payload().data()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn run_synchronously_bypasses_the_store() {
        let queue = queue();
        let handle = queue
            .enqueue(
                "Configured",
                json!({}),
                DispatchOptions::builder().run_synchronously().build(),
            )
            .await
            .unwrap();
        assert_eq!(handle.status(), &DispatchStatus::Completed);
        assert_eq!(queue.counts().await.unwrap().waiting, 0);
    }
}
