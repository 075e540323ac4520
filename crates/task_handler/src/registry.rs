use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::{
    context::JobContext,
    handler::TaskHandler,
    module::{ActionRef, HandlerFuture, JobConfig, JobModule, Resolved},
};

/// Runs actions referenced by name from job modules
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run_action(&self, action: &str, payload: Value) -> Result<(), String>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("No handler registered for job `{0}`")]
    UnknownJob(String),
    #[error("Job `{0}` defines neither a handle function, an action nor a default function")]
    NoResolutionStrategy(String),
    #[error("Job `{job}` delegates to action `{action}` but no action runner is configured")]
    ActionRunnerMissing { job: String, action: String },
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Whether the error comes from how jobs are registered rather than from running one
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, HandlerError::Failed(_))
    }
}

/// Explicit `name -> job module` map built at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    modules: BTreeMap<String, JobModule>,
    action_runner: Option<Arc<dyn ActionRunner>>,
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("modules", &self.modules)
            .field("action_runner", &self.action_runner.is_some())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module` under `name`, replacing any previous one
    pub fn define(mut self, name: impl Into<String>, module: JobModule) -> Self {
        self.register(name, module);
        self
    }

    /// Registers the typed task `T` under [`TaskHandler::IDENTIFIER`]
    pub fn define_task<T: TaskHandler>(self) -> Self {
        self.define(T::IDENTIFIER, JobModule::from_task::<T>())
    }

    /// Same as [`Self::define_task`] with job-level defaults
    pub fn define_task_with_config<T: TaskHandler>(self, config: JobConfig) -> Self {
        self.define(T::IDENTIFIER, JobModule::from_task::<T>().with_config(config))
    }

    pub fn with_action_runner(mut self, runner: Arc<dyn ActionRunner>) -> Self {
        self.action_runner = Some(runner);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, module: JobModule) {
        let name = name.into();
        debug!(job_name = %name, "Registering job");
        self.modules.insert(name, module);
    }

    pub fn get(&self, name: &str) -> Option<&JobModule> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Job-level defaults of `name`, if registered
    pub fn config(&self, name: &str) -> Option<&JobConfig> {
        self.modules.get(name).map(JobModule::config)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Registered jobs that declare a schedule
    pub fn scheduled(&self) -> impl Iterator<Item = (&str, &JobConfig)> {
        self.modules
            .iter()
            .filter(|(_, module)| module.config().schedule().is_some())
            .map(|(name, module)| (name.as_str(), module.config()))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Resolves the handler of `name` into a future owning everything it needs.
    ///
    /// # Errors
    ///
    /// A configuration error when the job is unknown, defines no strategy,
    /// or names an action without an action runner.
    pub fn prepare(
        &self,
        name: &str,
        payload: Value,
        ctx: JobContext,
    ) -> Result<HandlerFuture, HandlerError> {
        let module = self
            .modules
            .get(name)
            .ok_or_else(|| HandlerError::UnknownJob(name.to_string()))?;

        let future = match module.resolve() {
            Some(Resolved::Handle(handle)) => handle(payload),
            Some(Resolved::Action(ActionRef::Inline(action))) => action(payload),
            Some(Resolved::Action(ActionRef::Named(action))) => {
                let runner = self.action_runner.clone().ok_or_else(|| {
                    HandlerError::ActionRunnerMissing {
                        job: name.to_string(),
                        action: action.clone(),
                    }
                })?;
                let action = action.clone();
                async move { runner.run_action(&action, payload).await }.boxed()
            }
            Some(Resolved::Default(default_fn)) => default_fn(payload, ctx),
            None => return Err(HandlerError::NoResolutionStrategy(name.to_string())),
        };
        Ok(future)
    }

    /// Runs the handler of `name` to completion
    pub async fn run(&self, name: &str, payload: Value, ctx: JobContext) -> Result<(), HandlerError> {
        self.prepare(name, payload, ctx)?
            .await
            .map_err(HandlerError::Failed)
    }
}
