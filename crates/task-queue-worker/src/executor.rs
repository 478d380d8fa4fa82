use std::any::Any;
use std::sync::Arc;
use task_queue_broker::{Broker, TaskContext, TaskResult};
use task_queue_core::{FailureReason, Task};
use tracing::{debug, error};

/// Runs a task's handler in isolation.
///
/// The handler runs in its own tokio task so a panic becomes a failed
/// attempt instead of taking the worker down. Deadlines are enforced by the
/// broker's timeout sweep, not here.
pub struct TaskExecutor {
    broker: Arc<Broker>,
}

impl TaskExecutor {
    pub fn new(broker: Arc<Broker>) -> Self {
        TaskExecutor { broker }
    }

    pub async fn execute(&self, task: &Task) -> TaskResult {
        let Some(handler) = self.broker.handler(&task.name) else {
            error!("No handler registered for task name: {}", task.name);
            return Err(format!("no handler registered for '{}'", task.name));
        };

        debug!("Executing task {} with handler '{}'", task.id, task.name);
        let ctx = TaskContext::new(task.clone(), self.broker.clone());

        match tokio::spawn(async move { handler.execute(ctx).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!("Task {} panicked: {}", task.id, message);
                Err(FailureReason::HandlerException(format!("handler panicked: {}", message))
                    .as_error())
            }
            Err(_) => {
                error!("Task {} was aborted", task.id);
                Err(FailureReason::HandlerException("handler was aborted".to_string()).as_error())
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
