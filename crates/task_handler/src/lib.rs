//! How jobs are defined and looked up: a job module exposes a `handle` function,
//! an action, or a default `(payload, context)` function, registered by name.

mod context;
mod handler;
mod module;
mod registry;
mod task_result;

pub use context::JobContext;
pub use handler::{run_task, TaskHandler};
pub use module::{ActionRef, DefaultFn, HandleFn, HandlerFuture, JobConfig, JobModule, Resolved};
pub use registry::{ActionRunner, HandlerError, HandlerRegistry};
pub use task_result::IntoTaskHandlerResult;
pub use tokio_util::sync::CancellationToken;
