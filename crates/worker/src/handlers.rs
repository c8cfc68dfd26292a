//! Handlers shipped with the worker binary.

use async_trait::async_trait;
use tracing::info;

use taskmill_core::{HandlerError, QueueResult};
use taskmill_jobs::{HandlerRegistry, JobContext, JobHandler};

/// Logs the job and succeeds. Useful to check a deployment end to end
/// before real handlers are wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, ctx: JobContext) -> Result<(), HandlerError> {
        info!(
            job_id = %ctx.id,
            job_type = %ctx.job_type,
            attempt = ctx.attempts,
            payload = %ctx.payload,
            "log job"
        );
        Ok(())
    }
}

/// Registry serving every type in `types` with [`LogHandler`].
pub fn registry(types: &[String]) -> QueueResult<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    for job_type in types {
        registry.register(job_type.trim(), LogHandler)?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmill_core::QueueError;

    #[test]
    fn registers_each_type() {
        let registry = registry(&["log".to_string(), " report ".to_string()]).unwrap();

        assert_eq!(registry.types(), vec!["log".to_string(), "report".to_string()]);
    }

    #[test]
    fn blank_type_is_rejected() {
        let err = registry(&["log".to_string(), String::new()]).unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn log_handler_always_succeeds() {
        let ctx = JobContext {
            id: taskmill_core::JobId::new(),
            job_type: "log".to_string(),
            attempts: 1,
            max_attempts: 5,
            payload: serde_json::json!({ "hello": "world" }),
        };

        assert_eq!(LogHandler.handle(ctx).await, Ok(()));
    }
}
