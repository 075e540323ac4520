use jobqueue_job::JobId;
use jobqueue_migrations::MigrateError;
use jobqueue_task_handler::HandlerError;
use thiserror::Error;

/// Errors surfaced by the queue: configuration mistakes, store failures and
/// inline handler failures of the sync driver.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The named connection has no registered driver
    #[error("No queue driver configured for connection `{0}`")]
    DriverNotConfigured(String),

    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    Sql(#[from] sqlx::Error),

    /// A Redis command failed or the connection dropped
    #[error("Error occured while talking to redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// A payload could not be serialized or read back
    #[error("Error while serializing job payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error occured while migrating the queue schema: {0}")]
    Migrate(#[from] MigrateError),

    #[error("Job `{0}` not found")]
    JobNotFound(JobId),

    /// The job was recovered from this claim and handed out again, or is gone
    #[error("Job `{0}` is no longer reserved by this claim")]
    ReservationLost(JobId),

    #[error("Failed job `{0}` not found")]
    DeadLetterNotFound(JobId),

    /// A job run inline (sync driver) failed or could not be resolved
    #[error("Job handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("No scheduled job named `{0}`")]
    UnknownScheduledJob(String),

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),
}

impl QueueError {
    /// Whether the error comes from how the queue is set up rather than from a store
    pub fn is_configuration_error(&self) -> bool {
        match self {
            QueueError::DriverNotConfigured(_)
            | QueueError::UnknownScheduledJob(_)
            | QueueError::InvalidConfig(_) => true,
            QueueError::Handler(e) => e.is_configuration_error(),
            _ => false,
        }
    }
}

pub type Result<T> = core::result::Result<T, QueueError>;
