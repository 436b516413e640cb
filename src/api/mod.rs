//! Thin REST + websocket surface over the Scheduler and Progress Bus. Not
//! part of the specified core; exists only to exercise it end to end the
//! way the teacher's `api/` modules expose the download orchestrator.

pub mod websocket;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::model::{Quality, Task, TaskKind};
use crate::scheduler::{EnqueueRequest, Scheduler};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/ws", get(websocket::handler))
        .with_state(Arc::new(state))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub kind: CreateTaskKind,
    pub catalogue_id: String,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default = "default_quality")]
    pub quality: String,
}

fn default_quality() -> String {
    "best".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CreateTaskKind {
    Movie,
    Tv,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
}

async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateTaskRequest>,
) -> EngineResult<Json<CreateTaskResponse>> {
    let kind = match request.kind {
        CreateTaskKind::Movie => TaskKind::Movie,
        CreateTaskKind::Tv => {
            let season = request
                .season
                .ok_or_else(|| EngineError::Config("season is required for TV tasks".to_string()))?;
            let episode = request
                .episode
                .ok_or_else(|| EngineError::Config("episode is required for TV tasks".to_string()))?;
            TaskKind::Tv { season, episode }
        }
    };

    let task_id = state
        .scheduler
        .enqueue(EnqueueRequest {
            kind,
            catalogue_id: request.catalogue_id,
            languages: request.languages,
            quality: Quality::parse(&request.quality),
        })
        .await;

    Ok(Json(CreateTaskResponse { task_id }))
}

async fn get_task(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> EngineResult<Json<Task>> {
    state
        .scheduler
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(id))
}

async fn list_tasks(State(state): State<Arc<ApiState>>) -> Json<Vec<Task>> {
    Json(state.scheduler.list().await)
}

#[derive(Debug, Serialize)]
pub struct CancelTaskResponse {
    pub cancelled: bool,
}

async fn cancel_task(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Json<CancelTaskResponse> {
    let cancelled = state.scheduler.cancel(&id).await;
    Json(CancelTaskResponse { cancelled })
}
