//! HTTP surface: create monitor tasks, poll their progress, read notifications.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::github::{Credential, RepoRef};
use crate::monitor::{MONITOR_JOB_NAME, MONITOR_QUEUE, MonitorJob, Workflow};
use crate::progress::{ProgressReporter, ProgressStatus, ProgressValue, TaskProgress};
use crate::queue::{JobOptions, JobQueue};
use crate::store::Database;

const DEFAULT_NOTIFICATION_LIMIT: usize = 50;
const MAX_NOTIFICATION_LIMIT: usize = 100;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<JobQueue>,
    pub store: Arc<dyn Database>,
    /// Repository used when a request names none.
    pub default_repo: RepoRef,
    /// Retry policy of submitted monitor jobs.
    pub monitor_job_options: JobOptions,
}

/// Build the API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks/monitor", post(create_monitor_task))
        .route("/api/tasks/{user_id}/{task_id}", get(get_task_progress))
        .route("/api/notifications/{user_id}", get(list_notifications))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "report-jobs"
    }))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<Credential> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| Credential::new(token))
}

// ── Monitor tasks ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateMonitorTask {
    user_id: String,
    issue_number: u64,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    issue_url: Option<String>,
    #[serde(default)]
    repository: Option<RepoRef>,
    #[serde(flatten)]
    workflow: Workflow,
}

/// POST /api/tasks/monitor
///
/// The GitHub credential travels in `Authorization: Bearer`, never in the body.
async fn create_monitor_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<CreateMonitorTask>,
) -> Response {
    let Some(github_token) = bearer_token(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "Missing bearer token");
    };
    if body.user_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "user_id is required");
    }

    let repo = body.repository.clone().unwrap_or_else(|| state.default_repo.clone());
    let job = MonitorJob {
        task_id: body.task_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        issue_url: body
            .issue_url
            .unwrap_or_else(|| repo.issue_url(body.issue_number)),
        user_id: body.user_id,
        issue_number: body.issue_number,
        created_at: Utc::now(),
        repository: body.repository,
        workflow: body.workflow,
        github_token,
    };

    let reporter = ProgressReporter::new(
        Arc::clone(&state.store),
        job.user_id.clone(),
        job.task_id.clone(),
    );
    let queued = TaskProgress::new(
        ProgressStatus::Queued,
        "schedule",
        "Queued",
        format!("Waiting to check issue #{}", job.issue_number),
    )
    .with_progress(ProgressValue::Indeterminate);
    if let Err(e) = reporter.update(queued).await {
        error!(task_id = %job.task_id, "Failed to write queued progress: {}", e);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not create task");
    }

    let payload = match serde_json::to_value(&job) {
        Ok(payload) => payload,
        Err(e) => {
            error!(task_id = %job.task_id, "Failed to encode monitor job: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not create task");
        }
    };

    match state
        .queue
        .submit(MONITOR_QUEUE, MONITOR_JOB_NAME, payload, state.monitor_job_options)
        .await
    {
        Ok(job_id) => {
            info!(
                task_id = %job.task_id,
                job_id = %job_id,
                issue = job.issue_number,
                "Monitor task created"
            );
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "task_id": job.task_id, "job_id": job_id })),
            )
                .into_response()
        }
        Err(e) => {
            error!(task_id = %job.task_id, "Failed to submit monitor job: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not create task")
        }
    }
}

/// GET /api/tasks/{user_id}/{task_id}
///
/// 404 means "not started yet", not failure.
async fn get_task_progress(
    State(state): State<ApiState>,
    Path((user_id, task_id)): Path<(String, String)>,
) -> Response {
    match state.store.get_progress(&user_id, &task_id).await {
        Ok(Some(progress)) => Json(progress).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Task not found"),
        Err(e) => {
            error!(task_id = %task_id, "Failed to read progress: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not read task")
        }
    }
}

// ── Notifications ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NotificationQuery {
    limit: Option<usize>,
}

/// GET /api/notifications/{user_id}?limit=N, newest first.
async fn list_notifications(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(query): Query<NotificationQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_NOTIFICATION_LIMIT)
        .clamp(1, MAX_NOTIFICATION_LIMIT);
    match state.store.list_notifications(&user_id, limit).await {
        Ok(notifications) => Json(notifications).into_response(),
        Err(e) => {
            error!(user_id = %user_id, "Failed to list notifications: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not read notifications")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::notification::{Notification, Severity};
    use crate::queue::JobStatus;
    use crate::store::LibSqlBackend;

    async fn state() -> ApiState {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        ApiState {
            queue: Arc::new(JobQueue::new(Arc::clone(&store))),
            store,
            default_repo: RepoRef::new("owner", "reports"),
            monitor_job_options: JobOptions::default().with_attempts(3),
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_request(auth: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/tasks/monitor")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = api_routes(state().await);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn create_requires_bearer_token() {
        let app = api_routes(state().await);
        let body = serde_json::json!({
            "user_id": "u1",
            "issue_number": 42,
            "workflow_type": "validation",
        });
        let response = app.oneshot(create_request(None, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_queues_job_and_writes_progress() {
        let state = state().await;
        let app = api_routes(state.clone());
        let body = serde_json::json!({
            "user_id": "u1",
            "task_id": "t-42",
            "issue_number": 42,
            "workflow_type": "operations",
            "operation": "delete",
        });
        let response = app
            .clone()
            .oneshot(create_request(Some("Bearer ghp_abc"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let created = json_body(response).await;
        assert_eq!(created["task_id"], "t-42");

        let job_id: Uuid = created["job_id"].as_str().unwrap().parse().unwrap();
        let job = state.queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.queue, MONITOR_QUEUE);
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.max_attempts, 3);
        let payload: MonitorJob = job.payload_as().unwrap();
        assert!(payload.is_delete());
        assert_eq!(payload.github_token.expose(), "ghp_abc");
        assert_eq!(payload.issue_url, "https://github.com/owner/reports/issues/42");
        assert!(!format!("{job:?}").contains("ghp_abc"));

        let response = app
            .oneshot(
                Request::get("/api/tasks/u1/t-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let progress = json_body(response).await;
        assert_eq!(progress["status"], "queued");
        assert_eq!(progress["done"], false);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let app = api_routes(state().await);
        let response = app
            .oneshot(
                Request::get("/api/tasks/u1/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_are_listed_newest_first() {
        let state = state().await;
        for title in ["first", "second", "third"] {
            state
                .store
                .append_notification("u1", &Notification::new(Severity::Info, "info", title, "x"))
                .await
                .unwrap();
        }

        let app = api_routes(state);
        let response = app
            .oneshot(
                Request::get("/api/notifications/u1?limit=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list = json_body(response).await;
        let titles: Vec<_> = list
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["title"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(titles, vec!["third", "second"]);
    }
}
