//! Axum surface for the report pipeline: manual trigger, health, status.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use drr_core::RunResult;
use drr_pipeline::ReportRunner;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

pub const CRATE_NAME: &str = "drr-web";

/// What the handlers need from the pipeline. Narrow on purpose so tests can
/// stand in a stub without a database or an SMTP relay.
#[async_trait]
pub trait ReportService: Send + Sync {
    async fn trigger(&self) -> RunResult;
    async fn db_healthy(&self) -> bool;
}

#[async_trait]
impl ReportService for ReportRunner {
    async fn trigger(&self) -> RunResult {
        self.run().await
    }

    async fn db_healthy(&self) -> bool {
        ReportRunner::db_healthy(self).await
    }
}

pub struct AppState {
    service: Arc<dyn ReportService>,
    last_run: Mutex<Option<RunResult>>,
}

impl AppState {
    pub fn new(service: Arc<dyn ReportService>) -> Self {
        Self {
            service,
            last_run: Mutex::new(None),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", post(run_handler))
        .route("/run", post(run_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "report service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// 2xx means the run succeeded; 5xx covers both partial and full failure so
/// the external scheduler's alerting treats them alike.
async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = state.service.trigger().await;
    *state.last_run.lock().await = Some(result.clone());

    let code = if result.status.is_success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(result)).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let db = state.service.db_healthy().await;
    Json(serde_json::json!({ "db": db })).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.last_run.lock().await.clone() {
        Some(result) => Json(result).into_response(),
        None => Json(serde_json::json!({ "status": "never_run" })).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use drr_core::RunStatus;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct StubService {
        status: RunStatus,
        healthy: bool,
    }

    impl StubService {
        fn result(&self) -> RunResult {
            RunResult {
                run_id: Uuid::new_v4(),
                report: "new-users".to_string(),
                status: self.status,
                window: None,
                rows_fetched: 3,
                rows_appended: 3,
                rows_skipped_as_duplicate: 0,
                error: match self.status {
                    RunStatus::Success => None,
                    _ => Some("fetch: boom".to_string()),
                },
                notification_error: None,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl ReportService for StubService {
        async fn trigger(&self) -> RunResult {
            self.result()
        }

        async fn db_healthy(&self) -> bool {
            self.healthy
        }
    }

    fn app_with(status: RunStatus, healthy: bool) -> Router {
        app(AppState::new(Arc::new(StubService { status, healthy })))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn trigger_maps_success_to_200_with_the_result_body() {
        let app = app_with(RunStatus::Success, true);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["rows_appended"], 3);
    }

    #[tokio::test]
    async fn trigger_maps_failures_to_500() {
        for status in [RunStatus::Failure, RunStatus::PartialFailure] {
            let app = app_with(status, true);
            let resp = app
                .oneshot(
                    axum::http::Request::builder()
                        .method("POST")
                        .uri("/")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

            let body = body_json(resp).await;
            assert_eq!(body["error"], "fetch: boom");
        }
    }

    #[tokio::test]
    async fn health_reports_database_reachability_as_a_status() {
        for healthy in [true, false] {
            let app = app_with(RunStatus::Success, healthy);
            let resp = app
                .oneshot(
                    axum::http::Request::builder()
                        .uri("/health")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_json(resp).await["db"], healthy);
        }
    }

    #[tokio::test]
    async fn status_exposes_the_last_run_once_there_is_one() {
        let app = app_with(RunStatus::Success, true);

        let before = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(before).await["status"], "never_run");

        let _ = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let after = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(after).await;
        assert_eq!(body["report"], "new-users");
        assert_eq!(body["rows_fetched"], 3);
    }
}
