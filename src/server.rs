use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::gateway::salesforce::SalesforceGateway;
use crate::provider::ProviderRegistry;
use crate::queue::task::Task;
use crate::queue::RunQueue;
use crate::workflow::checkpoint::{self, CheckpointStore};
use crate::workflow::nba::default_pipeline;
use crate::workflow::stage::StageRegistry;
use crate::workflow::{RunStatus, WorkflowHandle, WorkflowManager};

pub struct AppState {
    pub config: AppConfig,
    pub manager: Arc<WorkflowManager>,
    pub queue: RunQueue,
}

impl AppState {
    /// Wire up providers, stages, gateways, and the run queue.
    ///
    /// The returned receiver feeds the queue processor.
    pub async fn new(config: AppConfig) -> Result<(Self, UnboundedReceiver<Task>)> {
        let providers = ProviderRegistry::from_config(&config.providers);
        let pipeline = config.pipeline.clone().unwrap_or_else(default_pipeline);
        let stages = StageRegistry::build(&pipeline, &providers, &config.workflow)?;
        tracing::info!(stages = ?stages.names(), "Pipeline ready");

        let salesforce = Arc::new(SalesforceGateway::new(&config.salesforce));
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::from(checkpoint::from_config(&config.checkpoint));
        let manager = Arc::new(WorkflowManager::new(
            Arc::new(stages),
            salesforce.clone(),
            salesforce,
            checkpoints,
            config.workflow.clone(),
        ));
        let (queue, rx) = RunQueue::new();

        Ok((Self::from_parts(config, manager, queue), rx))
    }

    pub fn from_parts(config: AppConfig, manager: Arc<WorkflowManager>, queue: RunQueue) -> Self {
        Self {
            config,
            manager,
            queue,
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(start_run))
        .route("/runs/:id", get(run_status).delete(discard_run))
        .route("/runs/:id/selection", post(select_recommendation))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub account_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SelectionRequest {
    pub recommendation_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: Uuid,
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunAccepted>)> {
    let handle = state.manager.start(&request.account_id).await?;
    state.queue.enqueue(Task::drive(handle));
    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id: handle.run_id,
        }),
    ))
}

async fn run_status(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunStatus>> {
    let status = state.manager.status(WorkflowHandle { run_id }).await?;
    Ok(Json(status))
}

async fn select_recommendation(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    Json(request): Json<SelectionRequest>,
) -> Result<(StatusCode, Json<RunAccepted>)> {
    let handle = WorkflowHandle { run_id };
    state
        .manager
        .select_recommendation(handle, &request.recommendation_id)
        .await?;
    state.queue.enqueue(Task::drive(handle));
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id })))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> Result<(StatusCode, Json<RunAccepted>)> {
    state.manager.cancel(WorkflowHandle { run_id }).await?;
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id })))
}

async fn discard_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> Result<StatusCode> {
    state.manager.discard(WorkflowHandle { run_id }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health_check() -> &'static str {
    "ok"
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::RunNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
