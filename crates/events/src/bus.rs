use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use futures::{future::BoxFuture, FutureExt};
use tracing::{debug, error, info, warn};

use crate::event::{EventPayload, QueueEvent};

pub type EventHandler = Arc<dyn Fn(EventPayload) -> BoxFuture<'static, ()> + Send + Sync>;
pub type AnyEventHandler =
    Arc<dyn Fn(QueueEvent, EventPayload) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned when registering a listener, used to remove it later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    event: Option<QueueEvent>,
}

impl Subscription {
    /// Event listened to, `None` for catch-all listeners
    pub fn event(&self) -> Option<QueueEvent> {
        self.event
    }
}

struct Listener {
    id: u64,
    once: bool,
    handler: EventHandler,
}

struct AnyListener {
    id: u64,
    handler: AnyEventHandler,
}

#[derive(Default)]
struct Listeners {
    by_event: HashMap<QueueEvent, Vec<Listener>>,
    any: Vec<AnyListener>,
}

/// Fan-out of lifecycle events to registered listeners.
///
/// Listeners run concurrently on emit and their failures never reach the emitter:
/// a panicking listener is logged and the others still run.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Listeners>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Listeners> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Listeners> {
        self.listeners.write().unwrap_or_else(|e| e.into_inner())
    }

    fn add<F, Fut>(&self, event: QueueEvent, once: bool, handler: F) -> Subscription
    where
        F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener = Listener {
            id,
            once,
            handler: Arc::new(move |payload| handler(payload).boxed()),
        };
        self.write()
            .by_event
            .entry(event)
            .or_default()
            .push(listener);
        Subscription {
            id,
            event: Some(event),
        }
    }

    /// Registers `handler` for every emission of `event`
    pub fn on<F, Fut>(&self, event: QueueEvent, handler: F) -> Subscription
    where
        F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(event, false, handler)
    }

    /// Registers `handler` for the next emission of `event` only
    pub fn once<F, Fut>(&self, event: QueueEvent, handler: F) -> Subscription
    where
        F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(event, true, handler)
    }

    /// Registers `handler` for every event, it receives the event alongside the payload
    pub fn on_any<F, Fut>(&self, handler: F) -> Subscription
    where
        F: Fn(QueueEvent, EventPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().any.push(AnyListener {
            id,
            handler: Arc::new(move |event, payload| handler(event, payload).boxed()),
        });
        Subscription { id, event: None }
    }

    /// Removes every listener of `event`
    pub fn off(&self, event: QueueEvent) {
        self.write().by_event.remove(&event);
    }

    /// Removes the listener registered under `subscription`
    ///
    /// # Returns
    ///
    /// Whether something was removed
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut listeners = self.write();
        match subscription.event {
            Some(event) => {
                let Some(list) = listeners.by_event.get_mut(&event) else {
                    return false;
                };
                let before = list.len();
                list.retain(|l| l.id != subscription.id);
                before != list.len()
            }
            None => {
                let before = listeners.any.len();
                listeners.any.retain(|l| l.id != subscription.id);
                before != listeners.any.len()
            }
        }
    }

    pub fn remove_all_listeners(&self) {
        let mut listeners = self.write();
        listeners.by_event.clear();
        listeners.any.clear();
    }

    /// Number of listeners that would receive `event`, catch-all listeners included
    pub fn listener_count(&self, event: QueueEvent) -> usize {
        let listeners = self.read();
        listeners.by_event.get(&event).map_or(0, Vec::len) + listeners.any.len()
    }

    /// Delivers `payload` to the listeners of `event` and waits for all of them
    pub async fn emit(&self, event: QueueEvent, payload: EventPayload) {
        log_event(event, &payload);

        let calls: Vec<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>> = {
            let mut listeners = self.write();
            let mut calls: Vec<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>> = Vec::new();
            if let Some(list) = listeners.by_event.get_mut(&event) {
                for listener in list.iter() {
                    let handler = listener.handler.clone();
                    let payload = payload.clone();
                    calls.push(Box::new(move || handler(payload)));
                }
                list.retain(|l| !l.once);
            }
            for listener in listeners.any.iter() {
                let handler = listener.handler.clone();
                let payload = payload.clone();
                calls.push(Box::new(move || handler(event, payload)));
            }
            calls
        };

        let futures = calls.into_iter().map(|call| async move {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(call)) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            if outcome.is_err() {
                error!(event = event.as_str(), "Event listener panicked");
            }
        });
        futures::future::join_all(futures).await;
    }
}

fn log_event(event: QueueEvent, payload: &EventPayload) {
    let job_id = payload.job_id().as_deref();
    let job_name = payload.job_name().as_deref();
    let queue = payload.queue_name().as_deref();
    match event {
        QueueEvent::JobFailed | QueueEvent::QueueError => error!(
            event = event.as_str(),
            job_id,
            job_name,
            queue,
            attempts = *payload.attempts_made(),
            error = payload.error().as_deref(),
            "Queue event"
        ),
        QueueEvent::JobRetrying | QueueEvent::JobStalled => warn!(
            event = event.as_str(),
            job_id,
            job_name,
            queue,
            attempts = *payload.attempts_made(),
            delay = ?payload.delay(),
            "Queue event"
        ),
        QueueEvent::WorkerStarted | QueueEvent::WorkerStopped => info!(
            event = event.as_str(),
            processor_id = payload.processor_id().as_deref(),
            "Queue event"
        ),
        _ => debug!(
            event = event.as_str(),
            job_id,
            job_name,
            queue,
            "Queue event"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn on_receives_matching_events_only() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        bus.on(QueueEvent::JobCompleted, move |payload| {
            let seen = seen.clone();
            async move {
                seen.lock()
                    .unwrap()
                    .push(payload.job_id().clone().unwrap_or_default());
            }
        });

        bus.emit(
            QueueEvent::JobCompleted,
            EventPayload::at(Utc::now()).with_job_id("1"),
        )
        .await;
        bus.emit(
            QueueEvent::JobFailed,
            EventPayload::at(Utc::now()).with_job_id("2"),
        )
        .await;

        assert_eq!(*log.lock().unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn once_fires_a_single_time() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        bus.once(QueueEvent::JobAdded, move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..3 {
            bus.emit(QueueEvent::JobAdded, EventPayload::at(Utc::now()))
                .await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(QueueEvent::JobAdded), 0);
    }

    #[tokio::test]
    async fn on_any_sees_every_event() {
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        let subscription = bus.on_any(move |event, _| {
            let e = e.clone();
            async move {
                e.lock().unwrap().push(event);
            }
        });

        bus.emit(QueueEvent::WorkerStarted, EventPayload::at(Utc::now()))
            .await;
        bus.emit(QueueEvent::JobStalled, EventPayload::at(Utc::now()))
            .await;
        assert!(bus.unsubscribe(subscription));
        bus.emit(QueueEvent::WorkerStopped, EventPayload::at(Utc::now()))
            .await;

        assert_eq!(
            *events.lock().unwrap(),
            vec![QueueEvent::WorkerStarted, QueueEvent::JobStalled]
        );
        assert!(!bus.unsubscribe(subscription));
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        bus.on(QueueEvent::JobFailed, |_| async {
            panic!("listener bug");
        });
        let c = count.clone();
        bus.on(QueueEvent::JobFailed, move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.emit(QueueEvent::JobFailed, EventPayload::at(Utc::now()))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn off_and_remove_all() {
        let bus = EventBus::new();
        bus.on(QueueEvent::JobAdded, |_| async {});
        bus.on(QueueEvent::JobAdded, |_| async {});
        bus.on(QueueEvent::JobCompleted, |_| async {});
        bus.on_any(|_, _| async {});
        assert_eq!(bus.listener_count(QueueEvent::JobAdded), 3);

        bus.off(QueueEvent::JobAdded);
        assert_eq!(bus.listener_count(QueueEvent::JobAdded), 1);
        assert_eq!(bus.listener_count(QueueEvent::JobCompleted), 2);

        bus.remove_all_listeners();
        assert_eq!(bus.listener_count(QueueEvent::JobCompleted), 0);
    }
}
