use getset::Getters;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// What a handler gets to know about the job it is running
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct JobContext {
    job_id: String,
    queue: String,
    name: String,
    /// Attempt being run, starting at 1
    attempts: u32,
    max_tries: u32,
    payload: Value,
    /// Cancelled when the job times out or the processor gives up on it
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        queue: impl Into<String>,
        name: impl Into<String>,
        attempts: u32,
        max_tries: u32,
        payload: Value,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            queue: queue.into(),
            name: name.into(),
            attempts,
            max_tries,
            payload,
            cancellation: CancellationToken::new(),
        }
    }

    /// Whether a failure of this attempt will be retried
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_tries
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
