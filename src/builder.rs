use std::{
    collections::HashSet,
    sync::{atomic::AtomicBool, Arc, Mutex},
    time::Duration,
};

use jobqueue_shutdown_signal::{never, shutdown_signal};
use rand::RngCore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    config::concurrency_from_env, context::QueueContext, dispatch::Queue, driver::QueueDriver,
    errors::QueueError, processor::Processor,
};

/// Configuration of a [`Processor`].
///
/// # Example
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
/// use jobqueue::{HandlerRegistry, JobModule, ProcessorOptions, Queue, QueueContext};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = HandlerRegistry::new()
///     .define("SendWelcomeEmail", JobModule::new().handle(|_| async {}));
/// let queue = Queue::in_memory(QueueContext::new(registry));
///
/// let processor = ProcessorOptions::default()
///     .dispatcher(queue)
///     .concurrency(4)
///     .poll_interval(Duration::from_millis(200))
///     .init()?;
///
/// processor.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ProcessorOptions {
    /// Jobs running at the same time, `QUEUE_CONCURRENCY` or 1 when unset
    concurrency: Option<usize>,

    /// Delay between claims when the store had nothing to hand out
    poll_interval: Option<Duration>,

    /// Restrict the processor to one queue
    queue: Option<String>,

    /// How long running jobs get to finish once shutdown is requested
    shutdown_timeout: Option<Duration>,

    /// Reservations older than this are considered abandoned
    stalled_threshold: Option<Duration>,

    /// How often the reaper looks for abandoned reservations
    stalled_check_interval: Option<Duration>,

    processor_id: Option<String>,

    /// Stop on SIGINT / SIGTERM
    listen_os_shutdown_signals: Option<bool>,

    driver: Option<Arc<dyn QueueDriver>>,
    context: Option<QueueContext>,
    dispatcher: Option<Queue>,
    /// Connection of the dispatcher to process, its default one when unset
    connection: Option<String>,
}

/// Errors that can occur when building a processor
#[derive(Error, Debug)]
pub enum ProcessorBuildError {
    /// Neither a driver nor a dispatcher was supplied
    #[error("Missing driver configuration - must provide either a driver or a dispatcher")]
    MissingDriver,

    #[error("Concurrency must be at least 1")]
    InvalidConcurrency,

    /// The requested connection could not be resolved
    #[error("Error occurred while resolving the connection: {0}")]
    Queue(#[from] QueueError),
}

impl ProcessorOptions {
    /// Builds the processor.
    ///
    /// The driver comes from [`Self::driver`] or, failing that, from the dispatcher's
    /// `connection` (its default one when unset). The context comes from
    /// [`Self::context`] or from the dispatcher.
    ///
    /// # Errors
    ///
    /// * No driver and no dispatcher
    /// * A concurrency of 0
    /// * An unknown connection name
    pub fn init(self) -> Result<Processor, ProcessorBuildError> {
        let driver = match (self.driver, &self.dispatcher) {
            (Some(driver), _) => driver,
            (None, Some(queue)) => match &self.connection {
                Some(name) => queue.connection(name)?,
                None => queue.connection(&queue.default_connection())?,
            },
            (None, None) => return Err(ProcessorBuildError::MissingDriver),
        };

        let ctx = match (self.context, &self.dispatcher) {
            (Some(ctx), _) => ctx,
            (None, Some(queue)) => queue.context().clone(),
            (None, None) => QueueContext::default(),
        };

        let concurrency = self.concurrency.unwrap_or_else(concurrency_from_env);
        if concurrency == 0 {
            return Err(ProcessorBuildError::InvalidConcurrency);
        }

        let processor_id = self.processor_id.unwrap_or_else(|| {
            let mut random_bytes = [0u8; 9];
            rand::thread_rng().fill_bytes(&mut random_bytes);
            format!("processor_{}", hex::encode(random_bytes))
        });

        let shutdown_signal = if self.listen_os_shutdown_signals.unwrap_or(true) {
            shutdown_signal()
        } else {
            never()
        };

        Ok(Processor {
            processor_id,
            concurrency,
            poll_interval: self.poll_interval.unwrap_or(Duration::from_millis(1000)),
            queue: self.queue,
            shutdown_timeout: self.shutdown_timeout.unwrap_or(Duration::from_secs(30)),
            stalled_threshold: self
                .stalled_threshold
                .unwrap_or(Duration::from_secs(30 * 60)),
            stalled_check_interval: self
                .stalled_check_interval
                .unwrap_or(Duration::from_secs(60)),
            driver,
            ctx,
            dispatcher: self.dispatcher,
            shutdown_signal,
            shutdown: CancellationToken::new(),
            paused: AtomicBool::new(false),
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Sets the number of jobs run at the same time.
    ///
    /// # Arguments
    /// * `value` - Maximum concurrent jobs
    pub fn concurrency(mut self, value: usize) -> Self {
        self.concurrency = Some(value);
        self
    }

    /// Sets how long to wait between two polls when no job was available
    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = Some(value);
        self
    }

    /// Only claims jobs pushed on `queue`
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn shutdown_timeout(mut self, value: Duration) -> Self {
        self.shutdown_timeout = Some(value);
        self
    }

    pub fn stalled_threshold(mut self, value: Duration) -> Self {
        self.stalled_threshold = Some(value);
        self
    }

    pub fn stalled_check_interval(mut self, value: Duration) -> Self {
        self.stalled_check_interval = Some(value);
        self
    }

    pub fn processor_id(mut self, id: impl Into<String>) -> Self {
        self.processor_id = Some(id.into());
        self
    }

    /// Whether SIGINT / SIGTERM stop the processor, enabled by default.
    /// Disable it in tests and drive shutdown through [`Processor::request_shutdown`].
    pub fn listen_os_shutdown_signals(mut self, value: bool) -> Self {
        self.listen_os_shutdown_signals = Some(value);
        self
    }

    /// Processes jobs of this driver directly
    pub fn driver(mut self, driver: Arc<dyn QueueDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn context(mut self, ctx: QueueContext) -> Self {
        self.context = Some(ctx);
        self
    }

    /// Facade the driver is taken from and chained jobs are dispatched through
    pub fn dispatcher(mut self, queue: Queue) -> Self {
        self.dispatcher = Some(queue);
        self
    }

    /// Connection of the dispatcher to process
    pub fn connection(mut self, name: impl Into<String>) -> Self {
        self.connection = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::SystemClock, driver::MemoryDriver};

    #[test]
    fn requires_a_driver() {
        assert!(matches!(
            ProcessorOptions::default().init(),
            Err(ProcessorBuildError::MissingDriver)
        ));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let result = ProcessorOptions::default()
            .driver(Arc::new(MemoryDriver::new(Arc::new(SystemClock))))
            .concurrency(0)
            .init();
        assert!(matches!(result, Err(ProcessorBuildError::InvalidConcurrency)));
    }

    #[test]
    fn unknown_connection_fails() {
        let result = ProcessorOptions::default()
            .dispatcher(Queue::in_memory(QueueContext::default()))
            .connection("nope")
            .init();
        assert!(matches!(result, Err(ProcessorBuildError::Queue(_))));
    }

    #[test]
    fn applies_defaults() {
        let processor = ProcessorOptions::default()
            .dispatcher(Queue::in_memory(QueueContext::default()))
            .concurrency(2)
            .listen_os_shutdown_signals(false)
            .init()
            .unwrap();
        assert_eq!(processor.concurrency(), &2);
        assert_eq!(processor.poll_interval(), &Duration::from_millis(1000));
        assert_eq!(processor.shutdown_timeout(), &Duration::from_secs(30));
        assert_eq!(processor.stalled_threshold(), &Duration::from_secs(1800));
        assert!(processor.processor_id().starts_with("processor_"));
        assert_eq!(processor.processor_id().len(), "processor_".len() + 18);
        assert_eq!(processor.driver().name(), "memory");
    }
}
