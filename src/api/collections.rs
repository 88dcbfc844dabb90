// Collections HTTP surface: item tags.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::infrastructure::middleware::trace_id_middleware;
use crate::models::{AddTagRequest, ItemResponse, ItemTagsResponse};
use crate::services::CollectionsService;

type Collections = Arc<CollectionsService>;

async fn health_check() -> &'static str {
    "OK"
}

async fn add_tag_to_item(
    State(service): State<Collections>,
    Path(item_id): Path<String>,
    Json(payload): Json<AddTagRequest>,
) -> AppResult<Json<ItemResponse>> {
    if payload.tag_name.is_empty() || payload.tag_name.len() > 50 {
        return Err(AppError::Validation(
            "tag_name must be between 1 and 50 characters".to_string(),
        ));
    }

    let validated_tag = service.add_tag(&item_id, &payload.tag_name).await?;
    Ok(Json(ItemResponse {
        item_id,
        validated_tag,
    }))
}

async fn get_item_tags(
    State(service): State<Collections>,
    Path(item_id): Path<String>,
) -> AppResult<Json<ItemTagsResponse>> {
    let tags = service.get_item_tags(&item_id).await?;
    Ok(Json(ItemTagsResponse { item_id, tags }))
}

pub fn create_collections_router(service: Collections) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(
            "/items/{item_id}/tags",
            get(get_item_tags).post(add_tag_to_item),
        )
        .layer(axum::middleware::from_fn(trace_id_middleware))
        .with_state(service)
}
