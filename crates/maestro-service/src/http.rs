//! HTTP transport: axum router, handlers, and SSE update streaming.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use maestro_orchestration::{WorkflowEvent, WorkflowEventKind};
use maestro_types::WorkflowId;

use crate::{
    CreateWorkflowRequest, ServiceConfig, ServiceError, WorkflowService, WorkflowUpdate,
};

/// Interval between SSE heartbeats while a stream is idle.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the service router.
pub fn router(service: WorkflowService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/workflows", post(create_workflow).get(list_workflows))
        .route("/v1/workflows/:id/execute", post(execute_workflow))
        .route("/v1/workflows/:id/status", get(workflow_status))
        .route("/v1/workflows/:id/pause", post(pause_workflow))
        .route("/v1/workflows/:id/resume", post(resume_workflow))
        .route("/v1/workflows/:id/cancel", post(cancel_workflow))
        .route("/v1/workflows/:id/updates", get(workflow_updates))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Bind the configured port and serve until shutdown.
pub async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    let service = WorkflowService::from_config(&config);
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.service_port)).await?;
    info!(port = config.service_port, "maestro service listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(service): State<WorkflowService>) -> impl IntoResponse {
    Json(service.health().await)
}

async fn create_workflow(
    State(service): State<WorkflowService>,
    Json(request): Json<CreateWorkflowRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(service.create_workflow(request).await?))
}

async fn execute_workflow(
    State(service): State<WorkflowService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(service.execute_workflow(WorkflowId(id)).await?))
}

async fn workflow_status(
    State(service): State<WorkflowService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(service.get_workflow_status(WorkflowId(id)).await?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    user_id: String,
}

async fn list_workflows(
    State(service): State<WorkflowService>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    Json(service.list_active_workflows(&query.user_id).await)
}

async fn pause_workflow(
    State(service): State<WorkflowService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(service.pause_workflow(WorkflowId(id)).await?))
}

async fn resume_workflow(
    State(service): State<WorkflowService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(service.resume_workflow(WorkflowId(id)).await?))
}

async fn cancel_workflow(
    State(service): State<WorkflowService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(service.cancel_workflow(WorkflowId(id)).await?))
}

async fn workflow_updates(
    State(service): State<WorkflowService>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceError> {
    let workflow_id = WorkflowId(id);
    // Reject streams for workflows that never existed.
    service.get_workflow_status(workflow_id).await?;

    let rx = service.orchestrator().subscribe_updates();
    let stream = futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let Some(event) = WorkflowEvent::from_message(&message) else {
                        continue;
                    };
                    if event.workflow_id != workflow_id {
                        continue;
                    }
                    let update = WorkflowUpdate {
                        update_id: event.update_id,
                        update_type: kind_str(event.kind).to_string(),
                        message: event.message,
                        data: event.data,
                        timestamp: event.timestamp,
                    };
                    let Ok(sse_event) = Event::default().event("update").json_data(&update)
                    else {
                        continue;
                    };
                    return Some((Ok::<_, Infallible>(sse_event), rx));
                }
                // Slow consumers skip ahead rather than ending the stream.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    ))
}

fn kind_str(kind: WorkflowEventKind) -> &'static str {
    match kind {
        WorkflowEventKind::PhaseStarted => "phase_started",
        WorkflowEventKind::PhaseCompleted => "phase_completed",
        WorkflowEventKind::StepStarted => "step_started",
        WorkflowEventKind::StepCompleted => "step_completed",
        WorkflowEventKind::StepFailed => "step_failed",
        WorkflowEventKind::WorkflowCompleted => "workflow_completed",
        WorkflowEventKind::WorkflowFailed => "workflow_failed",
        WorkflowEventKind::WorkflowCancelled => "workflow_cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = ServiceConfig {
            database_url: String::new(),
            cache_url: String::new(),
            llm_api_key: None,
            llm_model: "test".into(),
            llm_temperature: 0.7,
            llm_max_tokens: 1024,
            llm_timeout: Duration::from_secs(5),
            service_port: 0,
        };
        router(WorkflowService::from_config(&config))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["active_workflows"], 0);
    }

    #[tokio::test]
    async fn create_then_execute_over_http() {
        let app = app();

        let create = Request::post("/v1/workflows")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "user_input": "Build an e-commerce site with auth",
                    "session_id": "s1",
                    "user_id": "u1"
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(create).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        let workflow_id = created["workflow_id"].as_str().unwrap().to_string();
        assert!(created["steps"].as_array().unwrap().len() > 0);

        let execute = Request::post(format!("/v1/workflows/{workflow_id}/execute"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(execute).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["status"], "completed");

        let status = Request::get(format!("/v1/workflows/{workflow_id}/status"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(status).await.unwrap();
        let status = body_json(response).await;
        assert_eq!(status["percentage"], 100.0);
    }

    #[tokio::test]
    async fn unknown_workflow_is_404() {
        let response = app()
            .oneshot(
                Request::get(format!("/v1/workflows/{}/status", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_description_is_400() {
        let response = app()
            .oneshot(
                Request::post("/v1/workflows")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "user_input": "  ",
                            "session_id": "s1",
                            "user_id": "u1"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
