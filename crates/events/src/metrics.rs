use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use getset::Getters;

use crate::{EventBus, EventPayload, QueueEvent, Subscription};

const MAX_DURATION_SAMPLES: usize = 1000;
const MAX_RECENT_ERRORS: usize = 100;

/// A failure remembered by [`QueueMetrics`]
#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct RecordedError {
    job_id: Option<String>,
    job_name: Option<String>,
    queue_name: Option<String>,
    error: String,
    at: DateTime<Utc>,
}

/// Point-in-time copy of the collected metrics
#[derive(Debug, Clone, Default, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct MetricsSnapshot {
    jobs_added: u64,
    jobs_processed: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    jobs_retried: u64,
    jobs_stalled: u64,
    /// Mean handler duration over the last completions
    average_duration: Option<Duration>,
    /// Most recent first
    recent_errors: Vec<RecordedError>,
}

impl MetricsSnapshot {
    /// Share of finished jobs that failed permanently, 0 when nothing finished yet
    pub fn error_rate(&self) -> f64 {
        let finished = self.jobs_completed + self.jobs_failed;
        if finished == 0 {
            0.0
        } else {
            self.jobs_failed as f64 / finished as f64
        }
    }
}

#[derive(Default)]
struct MetricsState {
    jobs_added: u64,
    jobs_processed: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    jobs_retried: u64,
    jobs_stalled: u64,
    durations: VecDeque<Duration>,
    errors: VecDeque<RecordedError>,
}

impl MetricsState {
    fn record(&mut self, event: QueueEvent, payload: &EventPayload) {
        match event {
            QueueEvent::JobAdded => self.jobs_added += 1,
            QueueEvent::JobProcessing => self.jobs_processed += 1,
            QueueEvent::JobCompleted => {
                self.jobs_completed += 1;
                if let Some(duration) = payload.duration() {
                    if self.durations.len() == MAX_DURATION_SAMPLES {
                        self.durations.pop_front();
                    }
                    self.durations.push_back(*duration);
                }
            }
            QueueEvent::JobFailed => {
                self.jobs_failed += 1;
                if self.errors.len() == MAX_RECENT_ERRORS {
                    self.errors.pop_back();
                }
                self.errors.push_front(RecordedError {
                    job_id: payload.job_id().clone(),
                    job_name: payload.job_name().clone(),
                    queue_name: payload.queue_name().clone(),
                    error: payload.error().clone().unwrap_or_default(),
                    at: *payload.timestamp(),
                });
            }
            QueueEvent::JobRetrying => self.jobs_retried += 1,
            QueueEvent::JobStalled => self.jobs_stalled += 1,
            _ => {}
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let average_duration = match self.durations.len() {
            0 => None,
            n => Some(self.durations.iter().sum::<Duration>() / n as u32),
        };
        MetricsSnapshot {
            jobs_added: self.jobs_added,
            jobs_processed: self.jobs_processed,
            jobs_completed: self.jobs_completed,
            jobs_failed: self.jobs_failed,
            jobs_retried: self.jobs_retried,
            jobs_stalled: self.jobs_stalled,
            average_duration,
            recent_errors: self.errors.iter().cloned().collect(),
        }
    }
}

/// Collects counters and timings from the events of a bus
pub struct QueueMetrics {
    bus: Arc<EventBus>,
    subscription: Subscription,
    state: Arc<Mutex<MetricsState>>,
}

impl QueueMetrics {
    /// Starts listening to every event of `bus`
    pub fn attach(bus: Arc<EventBus>) -> Self {
        let state = Arc::new(Mutex::new(MetricsState::default()));
        let listener_state = state.clone();
        let subscription = bus.on_any(move |event, payload| {
            let state = listener_state.clone();
            async move {
                lock(&state).record(event, &payload);
            }
        });
        Self {
            bus,
            subscription,
            state,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        lock(&self.state).snapshot()
    }

    pub fn reset(&self) {
        *lock(&self.state) = MetricsState::default();
    }

    /// Stops listening, counters keep their last values
    pub fn detach(&self) {
        self.bus.unsubscribe(self.subscription);
    }
}

fn lock(state: &Mutex<MetricsState>) -> MutexGuard<'_, MetricsState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}
