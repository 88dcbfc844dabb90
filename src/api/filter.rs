// Filter HTTP surface: per-item update history.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use crate::error::AppResult;
use crate::infrastructure::middleware::trace_id_middleware;
use crate::models::ItemUpdatesResponse;
use crate::services::FilterService;

type Filter = Arc<FilterService>;

async fn health_check() -> &'static str {
    "OK"
}

async fn get_item_updates(
    State(service): State<Filter>,
    Path(item_id): Path<String>,
) -> AppResult<Json<ItemUpdatesResponse>> {
    let updates = service.get_updates(&item_id).await?;
    Ok(Json(ItemUpdatesResponse { item_id, updates }))
}

pub fn create_filter_router(service: Filter) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/updates/{item_id}", get(get_item_updates))
        .layer(axum::middleware::from_fn(trace_id_middleware))
        .with_state(service)
}
