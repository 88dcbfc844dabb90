// Shard node HTTP surface: record CRUD plus existence checks.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::error::AppResult;
use crate::infrastructure::middleware::trace_id_middleware;
use crate::models::{RecordData, RecordResponse};
use crate::services::StorageService;

type Storage = Arc<StorageService>;

async fn health_check() -> &'static str {
    "OK"
}

async fn create_record(
    State(service): State<Storage>,
    Path((table_name, primary_key)): Path<(String, String)>,
    Json(data): Json<RecordData>,
) -> AppResult<(StatusCode, Json<RecordResponse>)> {
    let stored_value = service
        .create_record(&table_name, &primary_key, data.value)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RecordResponse {
            table_name,
            primary_key,
            value: stored_value,
        }),
    ))
}

async fn read_record(
    State(service): State<Storage>,
    Path((table_name, primary_key)): Path<(String, String)>,
) -> AppResult<Json<RecordResponse>> {
    let value = service.read_record(&table_name, &primary_key).await?;
    Ok(Json(RecordResponse {
        table_name,
        primary_key,
        value,
    }))
}

async fn delete_record(
    State(service): State<Storage>,
    Path((table_name, primary_key)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    service.delete_record(&table_name, &primary_key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn exists_record(
    State(service): State<Storage>,
    Path((table_name, primary_key)): Path<(String, String)>,
) -> StatusCode {
    if service.exists_record(&table_name, &primary_key).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

pub fn create_shard_router(service: Storage) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(
            "/records/{table_name}/{primary_key}",
            post(create_record)
                .get(read_record)
                .delete(delete_record)
                .head(exists_record),
        )
        .layer(axum::middleware::from_fn(trace_id_middleware))
        .with_state(service)
}
