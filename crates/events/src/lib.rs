//! Lifecycle events of the queue (`job:added`, `job:completed`, `job:failed`, ...),
//! the bus delivering them and a metrics collector built on top of it.

mod bus;
mod event;
mod metrics;

pub use bus::{AnyEventHandler, EventBus, EventHandler, Subscription};
pub use event::{EventPayload, QueueEvent, UnknownEventError};
pub use metrics::{MetricsSnapshot, QueueMetrics, RecordedError};
