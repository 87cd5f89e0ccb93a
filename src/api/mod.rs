use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::{JudgeError, Result};
use crate::service::{JobView, JudgeService};

/// Seconds a client should wait before retrying a saturated submit
const RETRY_AFTER_SECS: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub code: String,
    #[serde(default)]
    pub expected_output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn router(service: JudgeService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/submit", post(submit_handler))
        .route("/status/{job_id}", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

/// Serve the API until `shutdown` fires.
pub async fn serve(listener: TcpListener, service: JudgeService, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Judge API listening");
    }
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("Judge API stopped");
    Ok(())
}

async fn submit_handler(
    State(service): State<JudgeService>,
    payload: std::result::Result<Json<SubmitRequest>, JsonRejection>,
) -> std::result::Result<Json<SubmitResponse>, JudgeError> {
    let Json(request) =
        payload.map_err(|rejection| JudgeError::Validation(rejection.body_text()))?;
    let job_id = service.submit(request.code, request.expected_output).await?;
    Ok(Json(SubmitResponse { job_id }))
}

async fn status_handler(
    State(service): State<JudgeService>,
    Path(job_id): Path<String>,
) -> std::result::Result<Json<JobView>, JudgeError> {
    service.status_str(&job_id).map(Json)
}

async fn metrics_handler(State(service): State<JudgeService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        service.metrics().render(service.queue().depth()),
    )
}

async fn health_handler(State(service): State<JudgeService>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "workers": service.workers(),
        "active_workers": service.metrics().active_workers.get(),
        "queue_depth": service.queue().depth(),
        "queue_capacity": service.queue().capacity(),
        "jobs": service.store().len(),
    }))
}

fn status_code(error: &JudgeError) -> StatusCode {
    match error {
        JudgeError::Validation(_) => StatusCode::BAD_REQUEST,
        JudgeError::NotFound(_) => StatusCode::NOT_FOUND,
        JudgeError::QueueSaturated { .. } | JudgeError::QueueClosed => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for JudgeError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });

        if status == StatusCode::SERVICE_UNAVAILABLE {
            (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
