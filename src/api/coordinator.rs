// Coordinator HTTP surface: table definitions, record routing, shard
// self-registration and the topology health report.

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::infrastructure::middleware::trace_id_middleware;
use crate::models::{CreateRecordRequest, RecordResponse, ShardRegistration, TableDefinition};
use crate::services::CoordinatorService;

type Coordinator = Arc<CoordinatorService>;

async fn health_check() -> &'static str {
    "OK"
}

async fn register_table(
    State(service): State<Coordinator>,
    Json(table): Json<TableDefinition>,
) -> AppResult<(StatusCode, Json<TableDefinition>)> {
    service.register_table(table.clone()).await?;
    Ok((StatusCode::CREATED, Json(table)))
}

async fn list_tables(State(service): State<Coordinator>) -> Json<Vec<TableDefinition>> {
    Json(service.get_all_tables().await)
}

async fn delete_table(
    State(service): State<Coordinator>,
    Path(table_name): Path<String>,
) -> AppResult<Json<Value>> {
    service.delete_table(&table_name).await?;
    Ok(Json(json!({"status": "deleted"})))
}

async fn create_record(
    State(service): State<Coordinator>,
    Json(record): Json<CreateRecordRequest>,
) -> AppResult<(StatusCode, Json<RecordResponse>)> {
    let response = service
        .create_record(&record.table_name, record.value)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET/HEAD/DELETE on a record: forward to the node the ring selects,
/// preserving the inbound method, headers, query and body. HEAD requests
/// reach this handler through the GET route.
async fn record_proxy(
    State(service): State<Coordinator>,
    Path((table_name, primary_key)): Path<(String, String)>,
    request: Request,
) -> AppResult<Response> {
    let method = request.method().clone();
    let headers = request.headers().clone();
    let query = request.uri().query().map(str::to_owned);
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|err| AppError::BadRequest(format!("Unreadable request body: {}", err)))?;

    let (status, record) = service
        .forward_record_request(&table_name, &primary_key, method, headers, query, body)
        .await?;

    Ok(match record {
        Some(record) => (status, Json(record)).into_response(),
        None => status.into_response(),
    })
}

async fn register_shard(
    State(service): State<Coordinator>,
    Json(payload): Json<ShardRegistration>,
) -> Json<Value> {
    service
        .register_shard_node(&payload.group_id, &payload.shard_url, payload.is_leader)
        .await;
    Json(json!({"status": "registered"}))
}

async fn health_report(State(service): State<Coordinator>) -> Json<Value> {
    Json(json!({
        "status": "active",
        "details": service.topology_status().await,
    }))
}

pub fn create_coordinator_router(service: Coordinator) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/tables", post(register_table).get(list_tables))
        .route("/tables/{table_name}", delete(delete_table))
        .route("/records", post(create_record))
        .route(
            "/records/{table_name}/{primary_key}",
            get(record_proxy).delete(record_proxy),
        )
        .route("/_internal/register_shard", post(register_shard))
        .route("/ops/health-report", get(health_report))
        .layer(axum::middleware::from_fn(trace_id_middleware))
        .with_state(service)
}
