use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};
use jobqueue_events::{EventBus, EventPayload, QueueEvent};
use jobqueue_task_handler::HandlerRegistry;

use crate::{
    clock::{Clock, SystemClock},
    notifications::{FailureNotifier, LogNotifier},
};

/// Shared state of one queue setup: registered jobs, event bus, clock and failure notifier.
///
/// Built explicitly and handed to every component, cloning is cheap.
#[derive(Clone)]
pub struct QueueContext {
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn FailureNotifier>,
}

impl Default for QueueContext {
    fn default() -> Self {
        Self::new(HandlerRegistry::default())
    }
}

impl Debug for QueueContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueContext")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl QueueContext {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            events: Arc::new(EventBus::new()),
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn notifier(&self) -> &Arc<dyn FailureNotifier> {
        &self.notifier
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Emits `event` with a payload stamped at the current clock time
    pub async fn emit(&self, event: QueueEvent, build: impl FnOnce(EventPayload) -> EventPayload) {
        let payload = build(EventPayload::at(self.now()));
        self.events.emit(event, payload).await;
    }
}
