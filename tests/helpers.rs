#![allow(dead_code)]

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use jobqueue::{
    clock::mock::MockClock, EventPayload, FailureNotifier, HandlerRegistry, Processor, ProcessorOptions, Queue,
    QueueContext, QueueEvent,
};
use tokio::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub struct StaticCounter {
    cell: OnceCell<tokio::sync::Mutex<u32>>,
}

async fn init_job_count() -> tokio::sync::Mutex<u32> {
    tokio::sync::Mutex::new(0)
}

impl StaticCounter {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub async fn increment(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        let mut count = cell.lock().await;
        *count += 1;
        *count
    }

    pub async fn get(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        *cell.lock().await
    }
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer().with_test_writer();
        // Debug everywhere except sqlx, kept at warn so queries stay out of the output
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}

/// Every event emitted on a bus, in emission order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<(QueueEvent, EventPayload)>>>,
}

impl EventLog {
    pub fn attach(ctx: &QueueContext) -> Self {
        let log = Self::default();
        let events = log.events.clone();
        ctx.events().on_any(move |event, payload| {
            let events = events.clone();
            async move {
                events.lock().unwrap().push((event, payload));
            }
        });
        log
    }

    pub fn of(&self, event: QueueEvent) -> Vec<EventPayload> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn count(&self, event: QueueEvent) -> usize {
        self.of(event).len()
    }

    pub fn all(&self) -> Vec<(QueueEvent, EventPayload)> {
        self.events.lock().unwrap().clone()
    }

    /// Waits until `event` was emitted at least `count` times
    pub async fn wait_for(&self, event: QueueEvent, count: usize) {
        let log = self.clone();
        wait_until(Duration::from_secs(5), move || {
            let log = log.clone();
            async move { log.count(event) >= count }
        })
        .await;
    }
}

/// Memory-backed queue driven by a mock clock
pub struct TestQueue {
    pub clock: Arc<MockClock>,
    pub ctx: QueueContext,
    pub queue: Queue,
    pub events: EventLog,
}

impl TestQueue {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::starting_at(registry, Utc::now())
    }

    pub fn starting_at(registry: HandlerRegistry, now: DateTime<Utc>) -> Self {
        let clock = Arc::new(MockClock::new(now));
        let ctx = QueueContext::new(registry).with_clock(clock.clone());
        let events = EventLog::attach(&ctx);
        let queue = Queue::in_memory(ctx.clone());
        Self {
            clock,
            ctx,
            queue,
            events,
        }
    }

    /// Rebuilds the queue around a context using `notifier`
    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.ctx = self.ctx.with_notifier(notifier);
        self.queue = Queue::in_memory(self.ctx.clone());
        self
    }

    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions::default()
            .dispatcher(self.queue.clone())
            .listen_os_shutdown_signals(false)
            .poll_interval(Duration::from_millis(10))
    }

    pub fn processor(&self, concurrency: usize) -> Processor {
        self.processor_options()
            .concurrency(concurrency)
            .init()
            .expect("Failed to create processor")
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(chrono::Duration::seconds(seconds));
    }
}

/// Polls `condition` until it holds, panics after `timeout`
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("Condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// `DATABASE_URL`, when the store tests should run
pub fn database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

/// `REDIS_URL`, when the store tests should run
pub fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok()
}

/// A schema or key prefix nobody else uses
pub fn unique_namespace() -> String {
    format!("jobqueue_test_{}", uuid::Uuid::new_v4().simple())
}
