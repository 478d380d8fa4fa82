use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use task_queue_broker::{Broker, BrokerConfig, TaskContext, TaskHandler, TaskResult};
use task_queue_core::SubmitOptions;
use task_queue_worker::{WorkerConfig, WorkerPool};

/// Custom task handler for processing images
struct ImageProcessorHandler;

#[async_trait]
impl TaskHandler for ImageProcessorHandler {
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        #[derive(Deserialize)]
        struct ImageTask {
            url: String,
            operations: Vec<String>,
        }

        let task: ImageTask = serde_json::from_value(ctx.payload().clone())
            .map_err(|e| format!("Invalid task payload: {}", e))?;

        println!("Processing image: {} ({:?})", task.url, task.operations);

        // One notification per processed image
        ctx.submit_child(
            "notify",
            json!({"user_id": "u-42", "message": format!("{} is ready", task.url), "channel": "email"}),
            SubmitOptions::new(),
        )
        .map_err(|e| e.to_string())?;

        tokio::time::sleep(Duration::from_millis(300)).await;

        #[derive(Serialize)]
        struct ImageResult {
            processed_url: String,
            size_kb: u64,
        }

        serde_json::to_value(ImageResult {
            processed_url: format!("{}/processed", task.url),
            size_kb: 256,
        })
        .map_err(|e| format!("Failed to serialize result: {}", e))
    }
}

/// Custom task handler for sending notifications
struct NotificationHandler;

#[async_trait]
impl TaskHandler for NotificationHandler {
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        #[derive(Deserialize)]
        struct Notification {
            user_id: String,
            message: String,
            channel: String,
        }

        let notif: Notification = serde_json::from_value(ctx.payload().clone())
            .map_err(|e| format!("Invalid notification: {}", e))?;

        println!(
            "Sending {} notification to user {}: {}",
            notif.channel, notif.user_id, notif.message
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(json!("Notification sent"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let broker = Arc::new(Broker::new(BrokerConfig::default())?);
    broker.register_handler("process_image", ImageProcessorHandler);
    broker.register_handler("notify", NotificationHandler);
    let monitors = broker.start_monitors();

    let config = WorkerConfig {
        concurrency: 4,
        ..Default::default()
    };
    let pool = WorkerPool::start(broker.clone(), &config);

    let image = broker
        .submit_task(
            "process_image",
            json!({"url": "https://example.com/cat.png", "operations": ["resize", "crop"]}),
            SubmitOptions::new().priority(7).dedupe_key("cat.png"),
        )?
        .ok_or_else(|| anyhow::anyhow!("duplicate submission"))?;

    let result = broker.get_result(&image, Duration::from_secs(10)).await?;
    println!("Image task finished: {:?} -> {:?}", result.status, result.result);

    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("Progress: {:?}", broker.get_progress(&image)?);

    pool.stop().await;
    monitors.stop().await;
    Ok(())
}
