//! HTTP surface of the log search scheduler.

use crate::AppState;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use logsearch::download::stream_bundles;
use logsearch::model::{PreviewRow, TaskGroupId, TaskId};
use logsearch::{SearchLogRequest, Target, Task, TaskGroup};
use serde::{Deserialize, Serialize};
use shared::errors::{ApiError, ApiJson, ApiQuery, EdgeError};
use std::time::Duration;

pub const DOWNLOAD_TOKEN_CONTEXT: &str = "logs/download";
pub const DOWNLOAD_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize)]
pub struct CreateTaskGroupRequest {
    pub request: SearchLogRequest,
    pub targets: Vec<Target>,
}

#[derive(Debug, Serialize)]
pub struct TaskGroupResponse {
    pub task_group: TaskGroup,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub token: String,
}

/// Served without a session; the download token is the credential.
pub fn public_routes() -> Router<AppState> {
    Router::new().route("/logs/download", get(download))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/logs/taskgroup", put(create_task_group))
        .route("/logs/taskgroups", get(list_task_groups))
        .route(
            "/logs/taskgroups/{id}",
            get(get_task_group).delete(delete_task_group),
        )
        .route("/logs/taskgroups/{id}/preview", get(preview))
        .route("/logs/taskgroups/{id}/retry", post(retry))
        .route("/logs/taskgroups/{id}/cancel", post(cancel))
        .route("/logs/download/acquire_token", get(acquire_token))
}

async fn create_task_group(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CreateTaskGroupRequest>,
) -> Result<Json<TaskGroupResponse>, ApiError> {
    let (task_group, tasks) = state
        .scheduler
        .create_group(body.request, body.targets)
        .await?;
    Ok(Json(TaskGroupResponse { task_group, tasks }))
}

async fn list_task_groups(State(state): State<AppState>) -> Result<Json<Vec<TaskGroup>>, ApiError> {
    Ok(Json(state.scheduler.list_groups().await?))
}

async fn get_task_group(
    State(state): State<AppState>,
    Path(id): Path<TaskGroupId>,
) -> Result<Json<TaskGroupResponse>, ApiError> {
    let (task_group, tasks) = state.scheduler.get_group(id).await?;
    Ok(Json(TaskGroupResponse { task_group, tasks }))
}

async fn preview(
    State(state): State<AppState>,
    Path(id): Path<TaskGroupId>,
) -> Result<Json<Vec<PreviewRow>>, ApiError> {
    Ok(Json(state.scheduler.preview(id).await?))
}

async fn retry(
    State(state): State<AppState>,
    Path(id): Path<TaskGroupId>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.scheduler.retry(id).await?))
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<TaskGroupId>,
) -> Result<Json<()>, ApiError> {
    state.scheduler.abort(id).await?;
    Ok(Json(()))
}

async fn delete_task_group(
    State(state): State<AppState>,
    Path(id): Path<TaskGroupId>,
) -> Result<Json<()>, ApiError> {
    state.scheduler.delete(id).await?;
    Ok(Json(()))
}

fn parse_ids(pairs: &[(String, String)]) -> Result<Vec<TaskId>, EdgeError> {
    let ids = pairs
        .iter()
        .filter(|(key, _)| key == "id")
        .map(|(_, value)| {
            value
                .parse::<TaskId>()
                .map_err(|_| EdgeError::BadRequest(format!("invalid task id {value:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Err(EdgeError::BadRequest("at least one task id is required".into()));
    }
    Ok(ids)
}

/// Issues a short-lived token that downloads the bundles of the given tasks.
async fn acquire_token(
    State(state): State<AppState>,
    ApiQuery(pairs): ApiQuery<Vec<(String, String)>>,
) -> Result<Json<String>, ApiError> {
    let ids = parse_ids(&pairs)?;
    state.scheduler.bundles(&ids).await?;

    let payload = ids
        .iter()
        .map(TaskId::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let token = state
        .gate
        .signer
        .issue_scoped(DOWNLOAD_TOKEN_CONTEXT, &payload, DOWNLOAD_TOKEN_TTL)?;
    Ok(Json(token))
}

async fn download(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DownloadQuery>,
) -> Result<Response, ApiError> {
    let payload = state
        .gate
        .signer
        .verify_scoped(DOWNLOAD_TOKEN_CONTEXT, &query.token)?;
    let ids = payload
        .split(',')
        .map(|id| id.parse::<TaskId>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| EdgeError::BadRequest("malformed download token".into()))?;

    let tasks = state.scheduler.bundles(&ids).await?;
    Ok(stream_bundles(&tasks).await?)
}
