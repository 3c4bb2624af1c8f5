//! API route definitions.

use super::state::AppState;
use crate::engine;
use crate::model::Trigger;
use crate::storage;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tasks/{id}/run", post(run_task))
        .route("/tasks/{id}/results", get(task_results))
        .route("/tasks/{id}/schedule/reload", post(reload_schedule))
        .route("/results/{id}", get(get_result))
        .route("/schedules", get(list_schedules))
}

type ApiResponse = (StatusCode, Json<Value>);

fn ok(data: Value, meta: Value) -> ApiResponse {
    (StatusCode::OK, Json(json!({ "data": data, "meta": meta })))
}

fn error(status: StatusCode, message: String) -> ApiResponse {
    (status, Json(json!({ "error": { "message": message } })))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Default, Deserialize)]
struct RunBody {
    triggered_by_user: Option<String>,
}

/// Manual trigger: creates the result and returns its id immediately;
/// the run completes in the background.
async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<RunBody>>,
) -> ApiResponse {
    let user = body.and_then(|Json(b)| b.triggered_by_user);
    match engine::start_run(&state.ctx, id, Trigger::Manual, user).await {
        Ok(result_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "data": { "result_id": result_id, "status": "running" },
                "meta": { "timestamp": chrono::Utc::now().to_rfc3339() }
            })),
        ),
        Err(e) => error(StatusCode::NOT_FOUND, e.to_string()),
    }
}

async fn get_result(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResponse {
    match storage::get_result(&state.ctx.pool, id) {
        Ok(Some(result)) => match serde_json::to_value(&result) {
            Ok(data) => ok(data, json!({})),
            Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Ok(None) => error(StatusCode::NOT_FOUND, format!("result {} not found", id)),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_per_page")]
    per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

async fn task_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(pagination): Query<Pagination>,
) -> ApiResponse {
    match storage::list_results(&state.ctx.pool, id, pagination.page, pagination.per_page) {
        Ok((results, total)) => match serde_json::to_value(&results) {
            Ok(data) => ok(
                data,
                json!({
                    "total": total,
                    "page": pagination.page,
                    "per_page": pagination.per_page
                }),
            ),
            Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn list_schedules(State(state): State<AppState>) -> ApiResponse {
    let entries = state.scheduler.snapshot().await;
    match serde_json::to_value(&entries) {
        Ok(data) => ok(data, json!({ "total": entries.len() })),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Bring the live schedule registry in line with persisted task state
/// after an external edit.
async fn reload_schedule(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResponse {
    match state.scheduler.reload_task(id).await {
        Ok(registered) => ok(json!({ "task_id": id, "registered": registered }), json!({})),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
