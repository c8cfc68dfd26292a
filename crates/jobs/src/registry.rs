//! Job handler registration.
//!
//! Handlers are registered by exact job type at startup; the registry is then
//! frozen behind an `Arc` and shared by the queue manager and every pool.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use taskmill_core::{HandlerError, Job, JobId, QueueError, QueueResult};

/// What a handler sees of the job it is running.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub id: JobId,
    pub job_type: String,
    /// 1-based attempt number of this execution.
    pub attempts: u32,
    pub max_attempts: u32,
    pub payload: Value,
}

impl JobContext {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            payload: job.payload.clone(),
        }
    }

    /// Decode the payload; a shape mismatch is a fatal validation error.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// No retry will follow a retryable failure of this attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Application code that executes one job type.
///
/// Return `HandlerError::Fatal` for inputs that can never succeed; anything
/// else (including errors lifted with `?` from `anyhow`) is retried.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<(), HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler:
///
/// ```ignore
/// registry.register("email.send", handler_fn(|ctx| async move {
///     let email: Email = ctx.payload_as()?;
///     mailer.send(email).await?;
///     Ok(())
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

/// Job type -> handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous registration.
    pub fn register<H: JobHandler>(
        &mut self,
        job_type: impl Into<String>,
        handler: H,
    ) -> QueueResult<()> {
        let job_type = job_type.into();
        validate_job_type(&job_type)?;
        self.handlers.insert(job_type, Arc::new(handler));
        Ok(())
    }

    /// Builder-style registration for static setups.
    pub fn with_handler<H: JobHandler>(
        mut self,
        job_type: impl Into<String>,
        handler: H,
    ) -> QueueResult<Self> {
        self.register(job_type, handler)?;
        Ok(self)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

pub(crate) fn validate_job_type(job_type: &str) -> QueueResult<()> {
    if job_type.trim().is_empty() {
        return Err(QueueError::validation("job type must not be empty"));
    }
    if job_type.chars().any(char::is_whitespace) {
        return Err(QueueError::validation(format!(
            "job type '{job_type}' must not contain whitespace"
        )));
    }
    Ok(())
}
