//! Built-in handlers registered by `tq-node`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use task_queue_broker::{Broker, TaskContext, TaskHandler, TaskResult};
use task_queue_core::SubmitOptions;

/// Returns the payload unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        Ok(ctx.payload().clone())
    }
}

/// Simulates work. The payload may override the duration with `duration_ms`.
pub struct SleepHandler {
    duration_ms: u64,
}

impl SleepHandler {
    pub fn new(duration_ms: u64) -> Self {
        SleepHandler { duration_ms }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let duration_ms = ctx.payload()["duration_ms"]
            .as_u64()
            .unwrap_or(self.duration_ms);

        let mut remaining = Duration::from_millis(duration_ms);
        let step = Duration::from_millis(100);
        while !remaining.is_zero() {
            if ctx.is_cancelled() {
                return Err("cancelled".to_string());
            }
            let nap = remaining.min(step);
            tokio::time::sleep(nap).await;
            remaining -= nap;
        }
        Ok(json!({ "slept_ms": duration_ms }))
    }
}

/// Summarises a JSON payload
pub struct JsonProcessorHandler;

#[async_trait]
impl TaskHandler for JsonProcessorHandler {
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let payload = ctx.payload();
        let result = match payload {
            Value::Object(obj) => json!({
                "key_count": obj.len(),
                "original": payload,
            }),
            Value::Array(items) => json!({
                "item_count": items.len(),
                "original": payload,
            }),
            Value::Null => return Err("Invalid JSON: empty payload".to_string()),
            _ => json!({ "original": payload }),
        };
        Ok(result)
    }
}

/// Splits work into child tasks.
///
/// Payload: `{"child": "<task name>", "items": [...]}`. Each item becomes
/// the payload of one child; the parent's progress follows the children.
pub struct FanOutHandler;

#[async_trait]
impl TaskHandler for FanOutHandler {
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let child = ctx.payload()["child"]
            .as_str()
            .ok_or("fan_out payload needs a 'child' task name")?
            .to_string();
        let items = ctx.payload()["items"]
            .as_array()
            .cloned()
            .ok_or("fan_out payload needs an 'items' array")?;

        let priority = ctx.task().priority;
        let mut children = Vec::with_capacity(items.len());
        for item in items {
            let submission = ctx
                .submit_child(child.as_str(), item, SubmitOptions::new().priority(priority))
                .map_err(|e| format!("failed to submit child: {}", e))?;
            match submission.task_id() {
                Some(id) => children.push(id),
                None => return Err(format!("child submission refused: {:?}", submission)),
            }
        }
        Ok(json!({ "children": children }))
    }
}

/// Fails until the given attempt, then succeeds.
///
/// Payload: `{"succeed_on_attempt": n}`; never succeeds when absent.
pub struct FlakyHandler;

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let attempt = ctx.attempt();
        match ctx.payload()["succeed_on_attempt"].as_u64() {
            Some(n) if u64::from(attempt) >= n => Ok(json!({ "attempt": attempt })),
            _ => Err(format!("flaky failure on attempt {}", attempt)),
        }
    }
}

/// Register every built-in handler on `broker`
pub fn register_demo_handlers(broker: &Broker) {
    broker.register_handler("echo", EchoHandler);
    broker.register_handler("sleep", SleepHandler::new(1000));
    broker.register_handler("json_processor", JsonProcessorHandler);
    broker.register_handler("fan_out", FanOutHandler);
    broker.register_handler("flaky", FlakyHandler);
}
