use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{context::JobContext, task_result::IntoTaskHandlerResult};

/// A job defined as a type: its fields are the job arguments.
///
/// ```rust
/// use jobqueue_task_handler::{IntoTaskHandlerResult, JobContext, TaskHandler};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize, Serialize)]
/// struct SendWelcomeEmail {
///     to: String,
/// }
///
/// impl TaskHandler for SendWelcomeEmail {
///     const IDENTIFIER: &'static str = "SendWelcomeEmail";
///
///     async fn run(self, _ctx: JobContext) -> impl IntoTaskHandlerResult {
///         println!("Sending welcome email to {}", self.to);
///         Ok::<(), String>(())
///     }
/// }
/// ```
pub trait TaskHandler: Serialize + DeserializeOwned + Send + 'static {
    /// Name the job is dispatched and registered under
    const IDENTIFIER: &'static str;

    fn run(self, ctx: JobContext) -> impl Future<Output = impl IntoTaskHandlerResult> + Send;
}

/// Deserializes `payload` into `T` and runs it
pub async fn run_task<T: TaskHandler>(payload: Value, ctx: JobContext) -> Result<(), String> {
    let task: T = serde_json::from_value(payload)
        .map_err(|e| format!("Invalid payload for job `{}`: {e}", T::IDENTIFIER))?;
    task.run(ctx).await.into_task_handler_result()
}
