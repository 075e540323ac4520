use std::{
    fmt::{Display, Formatter},
    str::FromStr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde_json::Value;
use thiserror::Error;

/// Lifecycle notifications fanned out by the [`crate::EventBus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEvent {
    JobAdded,
    JobProcessing,
    JobCompleted,
    JobFailed,
    JobRetrying,
    JobStalled,
    JobProgress,
    QueuePaused,
    QueueResumed,
    QueueError,
    WorkerStarted,
    WorkerStopped,
}

impl QueueEvent {
    pub const ALL: [QueueEvent; 12] = [
        QueueEvent::JobAdded,
        QueueEvent::JobProcessing,
        QueueEvent::JobCompleted,
        QueueEvent::JobFailed,
        QueueEvent::JobRetrying,
        QueueEvent::JobStalled,
        QueueEvent::JobProgress,
        QueueEvent::QueuePaused,
        QueueEvent::QueueResumed,
        QueueEvent::QueueError,
        QueueEvent::WorkerStarted,
        QueueEvent::WorkerStopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEvent::JobAdded => "job:added",
            QueueEvent::JobProcessing => "job:processing",
            QueueEvent::JobCompleted => "job:completed",
            QueueEvent::JobFailed => "job:failed",
            QueueEvent::JobRetrying => "job:retrying",
            QueueEvent::JobStalled => "job:stalled",
            QueueEvent::JobProgress => "job:progress",
            QueueEvent::QueuePaused => "queue:paused",
            QueueEvent::QueueResumed => "queue:resumed",
            QueueEvent::QueueError => "queue:error",
            QueueEvent::WorkerStarted => "worker:started",
            QueueEvent::WorkerStopped => "worker:stopped",
        }
    }
}

impl Display for QueueEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown queue event `{0}`")]
pub struct UnknownEventError(pub String);

impl FromStr for QueueEvent {
    type Err = UnknownEventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| UnknownEventError(s.to_string()))
    }
}

/// Data carried by every event. Fields that do not apply to an event are left empty.
#[derive(Debug, Clone, Default, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct EventPayload {
    job_id: Option<String>,
    queue_name: Option<String>,
    job_name: Option<String>,
    data: Option<Value>,
    error: Option<String>,
    timestamp: DateTime<Utc>,
    attempts_made: Option<u32>,
    /// Handler run time, on `job:completed`
    duration: Option<Duration>,
    /// Wait before the next attempt, on `job:retrying`
    delay: Option<Duration>,
    processor_id: Option<String>,
}

impl EventPayload {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_attempts_made(mut self, attempts: u32) -> Self {
        self.attempts_made = Some(attempts);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_processor_id(mut self, processor_id: impl Into<String>) -> Self {
        self.processor_id = Some(processor_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_round_trip() {
        for event in QueueEvent::ALL {
            assert_eq!(event.as_str().parse::<QueueEvent>(), Ok(event));
        }
        assert_eq!(
            "job:exploded".parse::<QueueEvent>(),
            Err(UnknownEventError("job:exploded".to_string()))
        );
    }
}
