use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::engine::Engine;
use crate::errors::EngineError;
use crate::issues::IssueStatus;
use crate::model::ExecutionStatus;
use crate::plan::PlanSpec;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Arc<Engine>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub plan: PlanSpec,
    /// Start right away; `false` leaves the Execution in `preparing`
    #[serde(default = "default_start")]
    pub start: bool,
}

fn default_start() -> bool {
    true
}

#[derive(Deserialize)]
pub struct UpdateIssueRequest {
    pub status: String,
    pub resolution: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: ExecutionStatus,
}

// ── Error type ────────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::NotFound(_) | EngineError::IssueNotFound(_) => ApiError::NotFound(message),
            EngineError::Plan(_) => ApiError::BadRequest(message),
            EngineError::InvalidTransition { .. }
            | EngineError::NoRollbackPlan(_)
            | EngineError::RollbackPlanLocked(_)
            | EngineError::InvalidIssueTransition { .. } => ApiError::Conflict(message),
            EngineError::ControllerGone(_) | EngineError::Store(_) => {
                error!(error = %message, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/executions", get(list_executions).post(submit_execution))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/start", post(start_execution))
        .route("/api/executions/{id}/pause", post(pause_execution))
        .route("/api/executions/{id}/resume", post(resume_execution))
        .route("/api/executions/{id}/rollback", post(rollback_execution))
        .route("/api/executions/{id}/issues", get(list_issues))
        .route(
            "/api/executions/{id}/issues/{issue_id}",
            patch(update_issue),
        )
        .route("/api/executions/{id}/metrics", get(get_metrics))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_executions(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.list().await?))
}

async fn submit_execution(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = &state.engine;
    let id = if req.start {
        engine.submit(req.plan).await?
    } else {
        engine.prepare(req.plan).await?
    };
    let status = engine.status(id).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id, status })))
}

async fn get_execution(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.snapshot(id).await?))
}

async fn start_execution(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.start(id).await?;
    control_response(&state, id).await
}

async fn pause_execution(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.pause(id).await?;
    control_response(&state, id).await
}

async fn resume_execution(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.resume(id).await?;
    control_response(&state, id).await
}

async fn rollback_execution(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.request_rollback(id).await?;
    control_response(&state, id).await
}

/// Control commands are accepted, not completed; report the state right after.
async fn control_response(state: &SharedState, id: Uuid) -> Result<Response, ApiError> {
    let status = state.engine.status(id).await?;
    let body = Json(serde_json::json!({"id": id, "status": status}));
    Ok((StatusCode::ACCEPTED, body).into_response())
}

async fn list_issues(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.issues(id).await?))
}

async fn update_issue(
    State(state): State<SharedState>,
    Path((id, issue_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = IssueStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let issue = state
        .engine
        .update_issue(id, issue_id, status, req.resolution)
        .await?;
    Ok(Json(issue))
}

async fn get_metrics(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.metrics(id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CutoverToml;
    use crate::issues::Issue;
    use crate::model::Execution;
    use crate::store::{ExecutionSummary, MemoryRepository};
    use crate::testing::ScriptedExecutor;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_engine(executor: ScriptedExecutor) -> Arc<Engine> {
        let config = CutoverToml::parse("[steps]\nretries = 0\n").unwrap();
        Arc::new(
            Engine::new(Arc::new(executor), Arc::new(MemoryRepository::new())).with_config(config),
        )
    }

    fn test_app(engine: Arc<Engine>) -> Router {
        api_router().with_state(Arc::new(AppState { engine }))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn plan_json(start: bool) -> serde_json::Value {
        serde_json::json!({
            "start": start,
            "plan": {
                "name": "api cutover",
                "phases": [
                    {"id": "a", "name": "A", "steps": [{"id": "s1", "name": "S1"}]},
                    {"id": "b", "name": "B", "depends_on": ["a"],
                     "steps": [{"id": "s2", "name": "S2", "critical": false}]}
                ]
            }
        })
    }

    async fn settle(engine: &Engine, id: Uuid) -> ExecutionStatus {
        tokio::time::timeout(Duration::from_secs(10), engine.wait_settled(id))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app(test_engine(ScriptedExecutor::new()));
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_executions_empty() {
        let app = test_app(test_engine(ScriptedExecutor::new()));
        let response = app.oneshot(get("/api/executions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list: Vec<ExecutionSummary> = body_json(response.into_body()).await;
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let engine = test_engine(ScriptedExecutor::new());
        let app = test_app(engine.clone());

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/executions", plan_json(true)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: SubmitResponse = body_json(response.into_body()).await;
        assert_eq!(settle(&engine, created.id).await, ExecutionStatus::Completed);

        let response = app
            .oneshot(get(&format!("/api/executions/{}", created.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let execution: Execution = body_json(response.into_body()).await;
        assert_eq!(execution.name, "api cutover");
        assert_eq!(execution.progress, 100.0);
    }

    #[tokio::test]
    async fn test_submit_cycle_is_bad_request() {
        let app = test_app(test_engine(ScriptedExecutor::new()));
        let body = serde_json::json!({
            "plan": {
                "name": "cyclic",
                "phases": [
                    {"id": "a", "name": "A", "depends_on": ["b"]},
                    {"id": "b", "name": "B", "depends_on": ["a"]}
                ]
            }
        });
        let response = app
            .oneshot(json_request("POST", "/api/executions", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let err: serde_json::Value = body_json(response.into_body()).await;
        assert!(err["error"].as_str().unwrap().contains("cycle"));
    }

    #[tokio::test]
    async fn test_control_commands() {
        let engine = test_engine(ScriptedExecutor::new());
        let app = test_app(engine.clone());

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/executions", plan_json(false)))
            .await
            .unwrap();
        let created: SubmitResponse = body_json(response.into_body()).await;
        assert_eq!(created.status, ExecutionStatus::Preparing);

        // nothing is running yet
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/executions/{}/pause", created.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/executions/{}/start", created.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(accepted["id"], created.id.to_string());
        assert_ne!(accepted["status"], "preparing");
        settle(&engine, created.id).await;

        // no rollback plan attached
        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/api/executions/{}/rollback", created.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let app = test_app(test_engine(ScriptedExecutor::new()));
        let response = app
            .oneshot(get(&format!("/api/executions/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_issue_update_flow() {
        let engine = test_engine(ScriptedExecutor::new().fail_always("s2", "lag", false));
        let app = test_app(engine.clone());

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/executions", plan_json(true)))
            .await
            .unwrap();
        let created: SubmitResponse = body_json(response.into_body()).await;
        settle(&engine, created.id).await;

        let response = app
            .clone()
            .oneshot(get(&format!("/api/executions/{}/issues", created.id)))
            .await
            .unwrap();
        let issues: Vec<Issue> = body_json(response.into_body()).await;
        assert_eq!(issues.len(), 1);
        let uri = format!("/api/executions/{}/issues/{}", created.id, issues[0].id);

        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &uri,
                serde_json::json!({"status": "sideways"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &uri,
                serde_json::json!({"status": "resolved"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(json_request(
                "PATCH",
                &uri,
                serde_json::json!({"status": "investigating", "resolution": "checking replica"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let issue: Issue = body_json(response.into_body()).await;
        assert_eq!(issue.status, IssueStatus::Investigating);
        assert_eq!(issue.resolution.as_deref(), Some("checking replica"));
    }

    #[tokio::test]
    async fn test_metrics_empty_without_probe() {
        let engine = test_engine(ScriptedExecutor::new());
        let app = test_app(engine.clone());
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/executions", plan_json(false)))
            .await
            .unwrap();
        let created: SubmitResponse = body_json(response.into_body()).await;

        let response = app
            .oneshot(get(&format!("/api/executions/{}/metrics", created.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let metrics: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(metrics.is_empty());
    }
}
