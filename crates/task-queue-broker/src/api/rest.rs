use crate::Broker;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use task_queue_core::{
    Priority, ProgressView, QueueName, QueueStats, ResultView, Submission, SubmitOptions, Task,
    TaskError, TaskStatus, WorkerView,
};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

const DEFAULT_RESULT_WAIT_MS: u64 = 30_000;
const MAX_RESULT_WAIT_MS: u64 = 300_000;

/// REST API routes
pub fn create_rest_api(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/api/v1/tasks", post(submit_task).get(list_tasks))
        .route("/api/v1/tasks/:task_id", get(get_task).delete(cancel_task))
        .route("/api/v1/tasks/:task_id/result", get(get_result))
        .route("/api/v1/tasks/:task_id/progress", get(get_progress))
        .route("/api/v1/queues", get(list_queues))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/dead-letters", get(list_dead_letters))
        .route(
            "/api/v1/dead-letters/:task_id/reprocess",
            post(reprocess_dead_letter),
        )
        .route("/api/v1/stats", get(get_stats))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    name: String,
    #[serde(default)]
    payload: Value,
    priority: Option<i32>,
    delay_ms: Option<u64>,
    parent_task_id: Option<Uuid>,
    #[serde(default)]
    tags: Vec<String>,
    dedupe_key: Option<String>,
    max_retries: Option<u32>,
    timeout_secs: Option<u64>,
}

impl SubmitTaskRequest {
    fn options(&self) -> SubmitOptions {
        let mut opts = SubmitOptions::new()
            .priority(Priority::new(self.priority.unwrap_or(0)))
            .tags(self.tags.iter().cloned());
        if let Some(delay_ms) = self.delay_ms {
            opts = opts.delay(Duration::from_millis(delay_ms));
        }
        if let Some(parent) = self.parent_task_id {
            opts = opts.parent(parent);
        }
        if let Some(key) = &self.dedupe_key {
            opts = opts.dedupe_key(key.clone());
        }
        if let Some(max_retries) = self.max_retries {
            opts = opts.max_retries(max_retries);
        }
        if let Some(timeout) = self.timeout_secs {
            opts = opts.timeout_secs(timeout);
        }
        opts
    }
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    task_id: Uuid,
    status: TaskStatus,
}

#[derive(Debug, Serialize)]
struct TaskResponse {
    task_id: Uuid,
    name: String,
    status: TaskStatus,
    priority: i32,
    queue: QueueName,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    retry_count: u32,
    max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_task_id: Option<Uuid>,
    child_task_ids: Vec<Uuid>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        TaskResponse {
            task_id: task.id,
            name: task.name,
            status: task.status,
            priority: task.priority.value(),
            queue: task.queue,
            tags: task.tags.into_iter().collect(),
            created_at: task.created_at,
            updated_at: task.updated_at,
            result: task.result,
            error: task.error,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            worker_id: task.worker_id,
            parent_task_id: task.parent_task_id,
            child_task_ids: task.child_task_ids,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
    name: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ResultQuery {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    tasks_by_status: BTreeMap<String, usize>,
    worker_count: usize,
    queues: BTreeMap<QueueName, QueueStats>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    connected_workers: usize,
    pending_tasks: usize,
}

/// Submit a new task
async fn submit_task(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Response, ApiError> {
    let opts = req.options();
    let response = match broker.submit(req.name, req.payload, opts)? {
        Submission::Accepted(task_id) => (
            StatusCode::CREATED,
            Json(SubmitTaskResponse {
                task_id,
                status: TaskStatus::Pending,
            }),
        )
            .into_response(),
        Submission::Duplicate { existing } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "duplicate": true,
                "existing_task_id": existing,
            })),
        )
            .into_response(),
        Submission::RateLimited { retry_after } => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string())],
            Json(serde_json::json!({
                "error": "rate limit exceeded",
                "retry_after_ms": retry_after.as_millis() as u64,
            })),
        )
            .into_response(),
    };
    Ok(response)
}

/// Get task by ID
async fn get_task(
    State(broker): State<Arc<Broker>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    Ok(Json(broker.get_task(&task_id)?.into()))
}

/// Wait for a task to finish
async fn get_result(
    State(broker): State<Arc<Broker>>,
    Path(task_id): Path<Uuid>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<ResultView>, ApiError> {
    let wait = query
        .timeout_ms
        .unwrap_or(DEFAULT_RESULT_WAIT_MS)
        .min(MAX_RESULT_WAIT_MS);
    let view = broker
        .get_result(&task_id, Duration::from_millis(wait))
        .await?;
    Ok(Json(view))
}

async fn get_progress(
    State(broker): State<Arc<Broker>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<ProgressView>, ApiError> {
    Ok(Json(broker.get_progress(&task_id)?))
}

/// Cancel a pending or running task
async fn cancel_task(
    State(broker): State<Arc<Broker>>,
    Path(task_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if broker.cancel(&task_id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        let status = broker.get_task(&task_id)?.status;
        Err(ApiError::Conflict(format!(
            "Task is {} and cannot be cancelled",
            status
        )))
    }
}

/// List tasks with filtering
async fn list_tasks(
    State(broker): State<Arc<Broker>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    let status = match &query.status {
        Some(s) => Some(
            TaskStatus::from_str(s)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown status: {}", s)))?,
        ),
        None => None,
    };

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(1000);

    let tasks = broker.list_tasks(|t| {
        status.map_or(true, |s| t.status == s)
            && query.name.as_deref().map_or(true, |n| t.name == n)
    });

    Ok(Json(
        tasks
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(TaskResponse::from)
            .collect(),
    ))
}

async fn list_queues(State(broker): State<Arc<Broker>>) -> Json<BTreeMap<QueueName, QueueStats>> {
    Json(broker.get_queue_stats())
}

/// List known workers
async fn list_workers(State(broker): State<Arc<Broker>>) -> Json<Vec<WorkerView>> {
    Json(broker.get_worker_stats())
}

async fn list_dead_letters(State(broker): State<Arc<Broker>>) -> Json<Vec<TaskResponse>> {
    Json(
        broker
            .dead_letters()
            .into_iter()
            .map(TaskResponse::from)
            .collect(),
    )
}

async fn reprocess_dead_letter(
    State(broker): State<Arc<Broker>>,
    Path(task_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match broker.reprocess_dead(&task_id)? {
        Submission::Accepted(new_id) => Ok((
            StatusCode::CREATED,
            Json(SubmitTaskResponse {
                task_id: new_id,
                status: TaskStatus::Pending,
            }),
        )
            .into_response()),
        Submission::Duplicate { existing } => Err(ApiError::Conflict(format!(
            "Dedupe key is held by task {}",
            existing
        ))),
        Submission::RateLimited { retry_after } => Err(TaskError::RateLimitExceeded {
            name: broker.get_task(&task_id)?.name,
            retry_after_ms: retry_after.as_millis() as u64,
        }
        .into()),
    }
}

/// Get system statistics
async fn get_stats(State(broker): State<Arc<Broker>>) -> Json<StatsResponse> {
    let tasks_by_status = broker
        .count_by_status()
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count))
        .collect();

    Json(StatsResponse {
        tasks_by_status,
        worker_count: broker.get_worker_stats().len(),
        queues: broker.get_queue_stats(),
    })
}

/// Health check endpoint
async fn health_check(State(broker): State<Arc<Broker>>) -> Json<HealthResponse> {
    let pending_tasks = broker.get_queue_stats().values().map(|q| q.pending).sum();
    Json(HealthResponse {
        status: "healthy".to_string(),
        connected_workers: broker.get_worker_stats().len(),
        pending_tasks,
    })
}

/// API error types
#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    PayloadTooLarge(String),
    Conflict(String),
    TooManyRequests { message: String, retry_after_ms: u64 },
    Internal(String),
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        let message = err.to_string();
        match err {
            TaskError::TaskNotFound(_) => ApiError::NotFound(message),
            TaskError::Validation(_) | TaskError::Serialization(_) => {
                ApiError::BadRequest(message)
            }
            TaskError::PayloadTooLarge { .. } => ApiError::PayloadTooLarge(message),
            TaskError::InvalidTransition { .. } => ApiError::Conflict(message),
            TaskError::RateLimitExceeded { retry_after_ms, .. } => ApiError::TooManyRequests {
                message,
                retry_after_ms,
            },
            TaskError::Persistence(_) => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::TooManyRequests {
                message,
                retry_after_ms,
            } => {
                let secs = retry_after_ms.div_ceil(1000).max(1);
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, secs.to_string())],
                    Json(serde_json::json!({ "error": message })),
                )
                    .into_response();
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
