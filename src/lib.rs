//! Job queue with interchangeable backends and a cron scheduler.
//!
//! Producers dispatch named jobs through a [`Queue`]. A [`Processor`] claims them from a
//! [`QueueDriver`] (sync, memory, PostgreSQL or Redis), runs their handler under a
//! timeout, retries failures with backoff and dead-letters jobs that run out of tries.
//! A [`Scheduler`] dispatches registered jobs on their cron schedule and a [`Reaper`]
//! recovers jobs abandoned by crashed processors.

pub mod builder;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod errors;
pub mod health;
pub mod notifications;
pub mod processor;
pub mod reaper;
pub mod scheduler;
pub mod testing;

pub use crate::builder::{ProcessorBuildError, ProcessorOptions};
pub use crate::clock::{Clock, SystemClock};
pub use crate::config::{ConnectionConfig, QueueConfig};
pub use crate::context::QueueContext;
pub use crate::dispatch::{
    Dispatch, DispatchOptions, DispatchOptionsBuilder, DispatchStatus, JobHandle, Queue,
};
pub use crate::driver::{
    DatabaseDriver, JobCounts, MemoryDriver, QueueDriver, RedisDriver, SyncDriver,
};
pub use crate::errors::{QueueError, Result};
pub use crate::health::{check_health, HealthReport, HealthStatus, HealthThresholds};
pub use crate::notifications::{FailedJobInfo, FailureNotifier, LogNotifier, NotificationPolicy};
pub use crate::processor::{ProcessJobError, Processor, ProcessorError, RunJobError};
pub use crate::reaper::Reaper;
pub use crate::scheduler::{ScheduledJob, Scheduler, SchedulerBuildError, SchedulerOptions};

pub use jobqueue_backoff::{Backoff, BackoffPolicy, BackoffStrategy};
pub use jobqueue_crontab_parser::{expand_alias, should_run, CronSchedule, Every};
pub use jobqueue_events::{EventBus, EventPayload, MetricsSnapshot, QueueEvent, QueueMetrics};
pub use jobqueue_job::{ChainedJob, DeadLetterRecord, Job, JobId, JobOptions, JobPayload};
pub use jobqueue_task_handler::{
    ActionRunner, HandlerError, HandlerRegistry, IntoTaskHandlerResult, JobConfig, JobContext,
    JobModule, TaskHandler,
};
