use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::Getters;
use jobqueue_backoff::Backoff;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue used when a dispatch does not name one
pub const DEFAULT_QUEUE: &str = "default";
/// Attempts allowed when a dispatch does not set `tries`
pub const DEFAULT_TRIES: u32 = 3;
/// Handler timeout when a dispatch does not set `timeout`
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Opaque job identifier, stable for the job's lifetime.
///
/// Stores hand out ids in their own format (sequence numbers for PostgreSQL and Redis),
/// they all travel as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        JobId(id.to_string())
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        JobId(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        JobId(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId(id.to_string())
    }
}

fn default_tries() -> u32 {
    DEFAULT_TRIES
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// Retry policy snapshot taken when the job is dispatched.
///
/// It travels inside the payload so retries happening long after the dispatch call
/// returned still follow what the producer asked for.
#[derive(Serialize, Deserialize, Getters, Debug, Clone, PartialEq)]
#[getset(get = "pub")]
pub struct JobOptions {
    /// Maximum number of attempts before the job is dead-lettered
    #[serde(default = "default_tries")]
    tries: u32,
    /// Handler timeout, in seconds
    #[serde(default = "default_timeout")]
    timeout: u64,
    /// Delay between attempts, the default 10 seconds when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff: Option<Backoff>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            tries: DEFAULT_TRIES,
            timeout: DEFAULT_TIMEOUT_SECONDS,
            backoff: None,
        }
    }
}

impl JobOptions {
    /// # Arguments
    ///
    /// * `tries` - Maximum attempts, values below 1 are raised to 1.
    /// * `timeout` - Handler timeout in seconds.
    /// * `backoff` - Optional retry delays.
    pub fn new(tries: u32, timeout: u64, backoff: Option<Backoff>) -> Self {
        Self {
            tries: tries.max(1),
            timeout,
            backoff,
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// A job to enqueue once the job carrying it has succeeded
#[derive(Serialize, Deserialize, Getters, Debug, Clone, PartialEq)]
#[getset(get = "pub")]
pub struct ChainedJob {
    /// Connection to enqueue on, the default one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue: Option<String>,
    /// Initial delay in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay: Option<u64>,
    payload: JobPayload,
}

impl ChainedJob {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            connection: None,
            queue: None,
            delay: None,
            payload,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn delayed(mut self, seconds: u64) -> Self {
        self.delay = Some(seconds);
        self
    }

    pub fn into_payload(self) -> JobPayload {
        self.payload
    }
}

/// What gets persisted for a job: its name, its arguments and its retry policy
#[derive(Serialize, Deserialize, Getters, Debug, Clone, PartialEq)]
#[getset(get = "pub")]
pub struct JobPayload {
    /// Name the handler is registered under
    name: String,
    /// Arguments handed to the handler
    #[serde(default)]
    data: Value,
    #[serde(default)]
    options: JobOptions,
    /// Jobs enqueued one after another, each only once the previous one succeeded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    chain: Vec<ChainedJob>,
}

impl JobPayload {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            options: JobOptions::default(),
            chain: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_chain(mut self, chain: Vec<ChainedJob>) -> Self {
        self.chain = chain;
        self
    }

    /// Splits off the next link of the chain.
    ///
    /// The returned job carries the rest of the chain after its own, so links keep
    /// running strictly one after another.
    pub fn next_in_chain(&self) -> Option<ChainedJob> {
        let (first, rest) = self.chain.split_first()?;
        let mut next = first.clone();
        next.payload.chain.extend(rest.iter().cloned());
        Some(next)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// A persisted unit of work
#[derive(Serialize, Deserialize, Getters, Debug, Clone, PartialEq, Builder)]
#[getset(get = "pub")]
#[builder(build_fn(private, name = "build_internal"), pattern = "owned")]
pub struct Job {
    #[builder(default, setter(into))]
    id: JobId,
    #[builder(default = "DEFAULT_QUEUE.to_string()", setter(into))]
    queue: String,
    #[builder(default = "JobPayload::new(\"\", Value::Null)")]
    payload: JobPayload,
    /// Execution attempts so far, incremented when the job is claimed
    #[builder(default)]
    attempts: u32,
    /// Set while a worker owns the job
    #[builder(default, setter(strip_option))]
    reserved_at: Option<DateTime<Utc>>,
    /// The job must not be claimed before this instant
    #[builder(default = "Utc::now()")]
    available_at: DateTime<Utc>,
    #[builder(default = "Utc::now()")]
    created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new builder for constructing a `Job`.
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Name of the handler to run
    pub fn name(&self) -> &str {
        self.payload.name()
    }

    pub fn max_tries(&self) -> u32 {
        *self.payload.options().tries()
    }

    pub fn timeout(&self) -> Duration {
        self.payload.options().timeout_duration()
    }

    pub fn backoff(&self) -> Option<&Backoff> {
        self.payload.options().backoff().as_ref()
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }

    pub fn is_available_at(&self, at: DateTime<Utc>) -> bool {
        self.reserved_at.is_none() && self.available_at <= at
    }

    /// Whether another attempt is allowed after the current one failed
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_tries()
    }

    /// Claims the job: counts the attempt and stamps the reservation
    pub fn reserve(&mut self, at: DateTime<Utc>) {
        self.attempts += 1;
        self.reserved_at = Some(at);
    }

    /// Whether this stored job is still reserved under `claim`, a snapshot returned by a claim.
    /// Each claim counts an attempt, so a job recovered and claimed again no longer matches.
    pub fn is_held_by(&self, claim: &Job) -> bool {
        self.id == claim.id && self.reserved_at.is_some() && self.attempts == claim.attempts
    }

    /// Gives the job back, claimable again from `available_at`
    pub fn release(&mut self, available_at: DateTime<Utc>) {
        self.reserved_at = None;
        self.available_at = available_at;
    }

    /// Resets attempts, used when replaying a dead-lettered job
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }
}

impl JobBuilder {
    /// Builds the Job with all configured values.
    pub fn build(self) -> Job {
        self.build_internal()
            .expect("All fields have defaults, build should never fail")
    }
}

/// Terminal record for a job that exhausted its attempts. Never mutated once created.
#[derive(Serialize, Deserialize, Getters, Debug, Clone, PartialEq)]
#[getset(get = "pub")]
pub struct DeadLetterRecord {
    /// Identifier of the record in the dead-letter store
    id: JobId,
    /// Identifier the job had while it was active
    job_id: JobId,
    queue: String,
    payload: JobPayload,
    /// Failure message of the last attempt
    exception: String,
    failed_at: DateTime<Utc>,
    attempts: u32,
}

impl DeadLetterRecord {
    pub fn new(id: JobId, job: &Job, exception: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            payload: job.payload.clone(),
            exception: exception.into(),
            failed_at,
            attempts: job.attempts,
        }
    }

    pub fn from_parts(
        id: JobId,
        job_id: JobId,
        queue: String,
        payload: JobPayload,
        exception: String,
        failed_at: DateTime<Utc>,
        attempts: u32,
    ) -> Self {
        Self {
            id,
            job_id,
            queue,
            payload,
            exception,
            failed_at,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_round_trips_with_retry_policy() {
        let payload = JobPayload::new("SendWelcomeEmail", json!({ "user": 42 })).with_options(
            JobOptions::new(3, 30, Some(Backoff::List(vec![1.0, 2.0, 4.0]))),
        );

        let raw = payload.to_json_string().unwrap();
        let decoded = JobPayload::from_json_str(&raw).unwrap();

        assert_eq!(decoded, payload);
        assert_eq!(decoded.options().tries(), &3);
        assert_eq!(
            decoded.options().backoff(),
            &Some(Backoff::List(vec![1.0, 2.0, 4.0]))
        );
    }

    #[test]
    fn payload_without_options_gets_defaults() {
        let decoded = JobPayload::from_json_str(r#"{"name": "Ping"}"#).unwrap();
        assert_eq!(decoded.name(), "Ping");
        assert_eq!(decoded.data(), &Value::Null);
        assert_eq!(decoded.options(), &JobOptions::default());
        assert_eq!(decoded.options().tries(), &DEFAULT_TRIES);
        assert_eq!(decoded.options().timeout(), &DEFAULT_TIMEOUT_SECONDS);
        assert!(decoded.chain().is_empty());
    }

    #[test]
    fn tries_are_at_least_one() {
        assert_eq!(JobOptions::new(0, 10, None).tries(), &1);
    }

    #[test]
    fn next_in_chain_carries_the_rest() {
        let payload = JobPayload::new("A", Value::Null).with_chain(vec![
            ChainedJob::new(JobPayload::new("B", Value::Null)).on_queue("b"),
            ChainedJob::new(JobPayload::new("C", Value::Null)),
            ChainedJob::new(JobPayload::new("D", Value::Null)),
        ]);

        let b = payload.next_in_chain().unwrap();
        assert_eq!(b.payload().name(), "B");
        assert_eq!(b.queue(), &Some("b".to_string()));
        let rest: Vec<_> = b.payload().chain().iter().map(|c| c.payload().name().clone()).collect();
        assert_eq!(rest, vec!["C", "D"]);

        let c = b.payload().next_in_chain().unwrap();
        let d = c.payload().next_in_chain().unwrap();
        assert_eq!(d.payload().name(), "D");
        assert!(d.payload().next_in_chain().is_none());
    }

    #[test]
    fn reserve_counts_attempt() {
        let now = Utc::now();
        let mut job = Job::builder()
            .id("1")
            .payload(JobPayload::new("A", Value::Null).with_options(JobOptions::new(2, 5, None)))
            .available_at(now)
            .build();

        assert!(job.is_available_at(now));
        job.reserve(now);
        assert_eq!(job.attempts(), &1);
        assert!(job.is_reserved());
        assert!(!job.is_available_at(now));
        assert!(job.can_retry());

        job.release(now);
        job.reserve(now);
        assert_eq!(job.attempts(), &2);
        assert!(!job.can_retry());
    }

    #[test]
    fn reclaimed_job_is_not_held_by_the_first_claim() {
        let now = Utc::now();
        let mut stored = Job::builder().id("3").available_at(now).build();
        stored.reserve(now);
        let first = stored.clone();
        assert!(stored.is_held_by(&first));

        stored.release(now);
        assert!(!stored.is_held_by(&first));

        stored.reserve(now);
        let second = stored.clone();
        assert!(!stored.is_held_by(&first));
        assert!(stored.is_held_by(&second));
    }

    #[test]
    fn dead_letter_snapshots_job() {
        let mut job = Job::builder().id("7").queue("emails").build();
        job.reserve(Utc::now());
        let record = DeadLetterRecord::new(JobId::from(1_i64), &job, "boom", Utc::now());
        assert_eq!(record.job_id(), &JobId::from("7"));
        assert_eq!(record.queue(), "emails");
        assert_eq!(record.attempts(), &1);
        assert_eq!(record.exception(), "boom");
    }
}
