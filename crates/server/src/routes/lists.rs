use axum::{
    Extension, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    card::{Card, CreateCard},
    list::{List, MoveList, RenameList},
};
use services::services::reorder::{CardMutation, DeleteAck, ListMutation};
use utils::response::ApiResponse;

use crate::{
    AppState,
    error::ApiError,
    extract::ApiJson,
    middleware::Actor,
};

/// GET /api/lists/{list}
pub async fn get_list(
    State(state): State<AppState>,
    Path(list): Path<String>,
) -> Result<ResponseJson<ApiResponse<List>>, ApiError> {
    let list = state.reorder().get_list(&list).await?;
    Ok(ResponseJson(ApiResponse::success(list)))
}

/// PATCH /api/lists/{list}
pub async fn rename_list(
    State(state): State<AppState>,
    Extension(Actor(actor_id)): Extension<Actor>,
    Path(list): Path<String>,
    ApiJson(payload): ApiJson<RenameList>,
) -> Result<ResponseJson<ApiResponse<List>>, ApiError> {
    let list = state
        .reorder()
        .rename_list(&list, &payload, Some(actor_id))
        .await?;
    Ok(ResponseJson(ApiResponse::success(list)))
}

/// POST /api/lists/{list}/move
pub async fn move_list(
    State(state): State<AppState>,
    Extension(Actor(actor_id)): Extension<Actor>,
    Path(list): Path<String>,
    ApiJson(payload): ApiJson<MoveList>,
) -> Result<ResponseJson<ApiResponse<ListMutation>>, ApiError> {
    let moved = state
        .reorder()
        .reorder_list(&list, &payload, Some(actor_id))
        .await?;
    Ok(ResponseJson(ApiResponse::success(moved)))
}

/// DELETE /api/lists/{list} - soft-deletes the list and its cards
pub async fn delete_list(
    State(state): State<AppState>,
    Extension(Actor(actor_id)): Extension<Actor>,
    Path(list): Path<String>,
) -> Result<ResponseJson<ApiResponse<DeleteAck>>, ApiError> {
    let ack = state.reorder().delete_list(&list, Some(actor_id)).await?;
    Ok(ResponseJson(ApiResponse::success(ack)))
}

/// GET /api/lists/{list}/cards
pub async fn list_cards(
    State(state): State<AppState>,
    Path(list): Path<String>,
) -> Result<ResponseJson<ApiResponse<Vec<Card>>>, ApiError> {
    let cards = state.reorder().list_cards(&list).await?;
    Ok(ResponseJson(ApiResponse::success(cards)))
}

/// POST /api/lists/{list}/cards
pub async fn create_card(
    State(state): State<AppState>,
    Extension(Actor(actor_id)): Extension<Actor>,
    Path(list): Path<String>,
    ApiJson(payload): ApiJson<CreateCard>,
) -> Result<ResponseJson<ApiResponse<CardMutation>>, ApiError> {
    let created = state
        .reorder()
        .create_card(&list, &payload, Some(actor_id))
        .await?;
    Ok(ResponseJson(ApiResponse::success(created)))
}

pub fn router() -> Router<AppState> {
    let list_router = Router::new()
        .route("/", get(get_list).patch(rename_list).delete(delete_list))
        .route("/move", post(move_list))
        .route("/cards", get(list_cards).post(create_card));

    Router::new().nest("/lists/{list}", list_router)
}
