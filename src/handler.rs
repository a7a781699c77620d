//! Execution handler trait definitions
//!
//! The handler is the external collaborator that actually performs a task
//! (typically a call to a model backend). The scheduler only decides when a
//! handler runs and what happens with its outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::id::TaskId;

/// Free-form per-task data passed through to the handler untouched.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Everything a handler needs for one attempt
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub payload: String,
    pub target_model: String,
    pub metadata: Metadata,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Performs one attempt of a task.
///
/// Returning `Err` marks the attempt failed and hands the task to the retry
/// policy. The scheduler discards the outcome of attempts whose task was
/// cancelled in the meantime, so implementations must not assume their
/// result is honored.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, request: TaskRequest) -> eyre::Result<String>;
}

/// Shared handle to a handler, as stored by schedulers and task specs
pub type SharedHandler = Arc<dyn TaskHandler>;

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskRequest) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<String>> + Send,
{
    async fn handle(&self, request: TaskRequest) -> eyre::Result<String> {
        (self.f)(request).await
    }
}

/// Wrap an async closure as a shared handler.
///
/// ```ignore
/// let handler = handler_fn(|req: TaskRequest| async move {
///     Ok(format!("{} answered {}", req.target_model, req.payload))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<String>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_fn_passes_request_through() {
        let handler = handler_fn(|req: TaskRequest| async move { Ok(format!("{}:{}:{}", req.target_model, req.payload, req.attempt)) });

        let out = handler
            .handle(TaskRequest {
                task_id: TaskId::new(1),
                payload: "hello".to_string(),
                target_model: "small".to_string(),
                metadata: Metadata::new(),
                attempt: 2,
            })
            .await
            .unwrap();

        assert_eq!(out, "small:hello:2");
    }

    #[tokio::test]
    async fn test_handler_fn_error() {
        let handler = handler_fn(|_req: TaskRequest| async move { Err(eyre::eyre!("backend unavailable")) });

        let err = handler
            .handle(TaskRequest {
                task_id: TaskId::new(1),
                payload: String::new(),
                target_model: String::new(),
                metadata: Metadata::new(),
                attempt: 1,
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "backend unavailable");
    }
}
