use crate::Broker;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use task_queue_core::{Submission, SubmitOptions, Task, TaskId, TaskStatus};

/// Result type for task handlers
pub type TaskResult = Result<Value, String>;

/// Trait for task handlers
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task; an `Err` counts as a failed attempt
    async fn execute(&self, ctx: TaskContext) -> TaskResult;
}

/// What a handler sees of the task it runs
#[derive(Clone)]
pub struct TaskContext {
    task: Task,
    broker: Arc<Broker>,
}

impl TaskContext {
    pub fn new(task: Task, broker: Arc<Broker>) -> Self {
        TaskContext { task, broker }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn payload(&self) -> &Value {
        &self.task.payload
    }

    pub fn attempt(&self) -> u32 {
        self.task.attempts
    }

    /// Submit a task owned by this one; its progress counts toward ours
    pub fn submit_child(
        &self,
        name: impl Into<String>,
        payload: Value,
        opts: SubmitOptions,
    ) -> task_queue_core::Result<Submission> {
        self.broker
            .submit(name, payload, opts.parent(self.task.id))
    }

    /// Cancellation is cooperative; long handlers may poll this
    pub fn is_cancelled(&self) -> bool {
        self.broker
            .get_task(&self.task.id)
            .map(|t| t.status == TaskStatus::Cancelled)
            .unwrap_or(true)
    }
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F>(F);

/// Wrap `f` as a [`TaskHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        (self.0)(ctx).await
    }
}

/// Registry of task handlers by task name
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        TaskHandlerRegistry {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler; a later registration for the same name replaces it
    pub fn register(&self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().insert(task_name.into(), handler);
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(task_name).cloned()
    }

    pub fn has_handler(&self, task_name: &str) -> bool {
        self.handlers.read().contains_key(task_name)
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BrokerConfig;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl TaskHandler for Upper {
        async fn execute(&self, ctx: TaskContext) -> TaskResult {
            let text = ctx.payload()["text"].as_str().ok_or("missing text")?;
            Ok(json!(text.to_uppercase()))
        }
    }

    fn context(payload: Value) -> TaskContext {
        let broker = Arc::new(Broker::new(BrokerConfig::default()).unwrap());
        let id = broker
            .submit("upper", payload, SubmitOptions::new())
            .unwrap()
            .task_id()
            .unwrap();
        let task = broker.get_task(&id).unwrap();
        TaskContext::new(task, broker)
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = TaskHandlerRegistry::new();
        registry.register("upper", Arc::new(Upper));
        registry.register("noop", Arc::new(handler_fn(|_ctx| async { Ok(Value::Null) })));

        assert!(registry.has_handler("upper"));
        assert!(!registry.has_handler("missing"));
        assert_eq!(registry.task_names(), vec!["noop", "upper"]);

        let ctx = context(json!({"text": "hi"}));
        let handler = registry.get("upper").unwrap();
        assert_eq!(handler.execute(ctx).await, Ok(json!("HI")));

        let ctx = context(json!({}));
        assert_eq!(handler.execute(ctx).await, Err("missing text".to_string()));
    }

    #[tokio::test]
    async fn test_submit_child_links_parent() {
        let ctx = context(json!({"text": "parent"}));
        let child = ctx
            .submit_child("upper", json!({"text": "child"}), SubmitOptions::new())
            .unwrap()
            .task_id()
            .unwrap();

        let parent = ctx.broker.get_task(&ctx.task_id()).unwrap();
        assert_eq!(parent.child_task_ids, vec![child]);
        assert_eq!(
            ctx.broker.get_task(&child).unwrap().parent_task_id,
            Some(ctx.task_id())
        );
        assert!(!ctx.is_cancelled());
    }
}
