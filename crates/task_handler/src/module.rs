use std::{fmt::Debug, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use getset::Getters;
use jobqueue_backoff::Backoff;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    context::JobContext,
    handler::{run_task, TaskHandler},
    task_result::IntoTaskHandlerResult,
};

pub type HandlerFuture = BoxFuture<'static, Result<(), String>>;
/// `handle(payload)`
pub type HandleFn = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;
/// `(payload, context)`
pub type DefaultFn = Arc<dyn Fn(Value, JobContext) -> HandlerFuture + Send + Sync>;

/// An action the job delegates to
#[derive(Clone)]
pub enum ActionRef {
    /// Resolved by the [`crate::ActionRunner`] of the registry
    Named(String),
    Inline(HandleFn),
}

impl Debug for ActionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionRef::Named(name) => f.debug_tuple("Named").field(name).finish(),
            ActionRef::Inline(_) => f.write_str("Inline"),
        }
    }
}

/// Defaults a job declares for itself.
/// Dispatch options take precedence, these apply when a dispatch leaves them unset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Getters)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    description: Option<String>,
    queue: Option<String>,
    tries: Option<u32>,
    /// Seconds
    timeout: Option<u64>,
    backoff: Option<Backoff>,
    /// Cron expression or alias the scheduler dispatches the job on
    #[serde(alias = "rate")]
    schedule: Option<String>,
    /// Do not dispatch a scheduled run while the previous one has not finished
    without_overlapping: bool,
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.backoff = Some(backoff.into());
        self
    }

    pub fn with_schedule(mut self, expression: impl Into<String>) -> Self {
        self.schedule = Some(expression.into());
        self
    }

    pub fn prevent_overlapping(mut self) -> Self {
        self.without_overlapping = true;
        self
    }
}

/// How a job module gets run, in resolution order
pub enum Resolved<'a> {
    Handle(&'a HandleFn),
    Action(&'a ActionRef),
    Default(&'a DefaultFn),
}

/// A registered job: up to three ways of running it plus its configuration.
///
/// Resolution tries `handle`, then `action`, then the default function.
#[derive(Clone, Default)]
pub struct JobModule {
    handle: Option<HandleFn>,
    action: Option<ActionRef>,
    default_fn: Option<DefaultFn>,
    config: JobConfig,
}

impl Debug for JobModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobModule")
            .field("handle", &self.handle.is_some())
            .field("action", &self.action)
            .field("default_fn", &self.default_fn.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl JobModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Module whose default function runs the typed task `T`
    pub fn from_task<T: TaskHandler>() -> Self {
        Self {
            default_fn: Some(Arc::new(|payload: Value, ctx: JobContext| {
                run_task::<T>(payload, ctx).boxed()
            })),
            ..Default::default()
        }
    }

    /// Sets the `handle(payload)` strategy
    pub fn handle<F, Fut, R>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTaskHandlerResult + 'static,
    {
        self.handle = Some(Arc::new(move |payload: Value| {
            handler(payload)
                .map(IntoTaskHandlerResult::into_task_handler_result)
                .boxed()
        }));
        self
    }

    /// Delegates to an action resolved by name
    pub fn action_named(mut self, action: impl Into<String>) -> Self {
        self.action = Some(ActionRef::Named(action.into()));
        self
    }

    /// Delegates to an inline action
    pub fn action<F, Fut, R>(mut self, action: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTaskHandlerResult + 'static,
    {
        self.action = Some(ActionRef::Inline(Arc::new(move |payload: Value| {
            action(payload)
                .map(IntoTaskHandlerResult::into_task_handler_result)
                .boxed()
        })));
        self
    }

    /// Sets the `(payload, context)` strategy
    pub fn default_fn<F, Fut, R>(mut self, handler: F) -> Self
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTaskHandlerResult + 'static,
    {
        self.default_fn = Some(Arc::new(move |payload: Value, ctx: JobContext| {
            handler(payload, ctx)
                .map(IntoTaskHandlerResult::into_task_handler_result)
                .boxed()
        }));
        self
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Picks the strategy to run, `None` when the module defines none
    pub fn resolve(&self) -> Option<Resolved<'_>> {
        if let Some(handle) = &self.handle {
            return Some(Resolved::Handle(handle));
        }
        if let Some(action) = &self.action {
            return Some(Resolved::Action(action));
        }
        self.default_fn.as_ref().map(Resolved::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_order_is_handle_action_default() {
        let all = JobModule::new()
            .default_fn(|_, _| async {})
            .action_named("Notify")
            .handle(|_| async {});
        assert!(matches!(all.resolve(), Some(Resolved::Handle(_))));

        let action_and_default = JobModule::new()
            .default_fn(|_, _| async {})
            .action_named("Notify");
        assert!(matches!(
            action_and_default.resolve(),
            Some(Resolved::Action(ActionRef::Named(name))) if name == "Notify"
        ));

        let default_only = JobModule::new().default_fn(|_, _| async {});
        assert!(matches!(default_only.resolve(), Some(Resolved::Default(_))));

        assert!(JobModule::new().resolve().is_none());
    }

    #[test]
    fn config_deserializes_rate_alias() {
        let config: JobConfig = serde_json::from_str(
            r#"{"queue": "emails", "tries": 5, "backoff": [1, 2], "rate": "@hourly", "withoutOverlapping": true}"#,
        )
        .unwrap();
        assert_eq!(config.queue(), &Some("emails".to_string()));
        assert_eq!(config.tries(), &Some(5));
        assert_eq!(config.schedule(), &Some("@hourly".to_string()));
        assert!(*config.without_overlapping());
    }
}
