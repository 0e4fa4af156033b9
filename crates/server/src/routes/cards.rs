use axum::{
    Extension, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post, put},
};
use db::models::{
    card::{Card, MoveCard, SetCardMembers, UpdateCard},
    label::{Label, SetCardLabels},
};
use services::services::reorder::{CardMutation, DeleteAck};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{
    AppState,
    error::ApiError,
    extract::ApiJson,
    middleware::Actor,
};

/// GET /api/cards/{card}
pub async fn get_card(
    State(state): State<AppState>,
    Path(card): Path<String>,
) -> Result<ResponseJson<ApiResponse<Card>>, ApiError> {
    let card = state.reorder().get_card(&card).await?;
    Ok(ResponseJson(ApiResponse::success(card)))
}

/// PATCH /api/cards/{card} - title and description only
pub async fn update_card(
    State(state): State<AppState>,
    Extension(Actor(actor_id)): Extension<Actor>,
    Path(card): Path<String>,
    ApiJson(payload): ApiJson<UpdateCard>,
) -> Result<ResponseJson<ApiResponse<Card>>, ApiError> {
    let card = state
        .reorder()
        .update_card(&card, &payload, Some(actor_id))
        .await?;
    Ok(ResponseJson(ApiResponse::success(card)))
}

/// POST /api/cards/{card}/move
pub async fn move_card(
    State(state): State<AppState>,
    Extension(Actor(actor_id)): Extension<Actor>,
    Path(card): Path<String>,
    ApiJson(payload): ApiJson<MoveCard>,
) -> Result<ResponseJson<ApiResponse<CardMutation>>, ApiError> {
    let moved = state
        .reorder()
        .reorder_card(&card, &payload, Some(actor_id))
        .await?;
    Ok(ResponseJson(ApiResponse::success(moved)))
}

/// DELETE /api/cards/{card}
pub async fn delete_card(
    State(state): State<AppState>,
    Extension(Actor(actor_id)): Extension<Actor>,
    Path(card): Path<String>,
) -> Result<ResponseJson<ApiResponse<DeleteAck>>, ApiError> {
    let ack = state.reorder().delete_card(&card, Some(actor_id)).await?;
    Ok(ResponseJson(ApiResponse::success(ack)))
}

/// PUT /api/cards/{card}/labels
pub async fn set_labels(
    State(state): State<AppState>,
    Path(card): Path<String>,
    ApiJson(payload): ApiJson<SetCardLabels>,
) -> Result<ResponseJson<ApiResponse<Vec<Label>>>, ApiError> {
    let labels = state
        .reorder()
        .set_card_labels(&card, &payload.label_ids)
        .await?;
    Ok(ResponseJson(ApiResponse::success(labels)))
}

/// PUT /api/cards/{card}/members
pub async fn set_members(
    State(state): State<AppState>,
    Path(card): Path<String>,
    ApiJson(payload): ApiJson<SetCardMembers>,
) -> Result<ResponseJson<ApiResponse<Vec<Uuid>>>, ApiError> {
    let members = state
        .reorder()
        .set_card_members(&card, &payload.member_ids)
        .await?;
    Ok(ResponseJson(ApiResponse::success(members)))
}

pub fn router() -> Router<AppState> {
    let card_router = Router::new()
        .route("/", get(get_card).patch(update_card).delete(delete_card))
        .route("/move", post(move_card))
        .route("/labels", put(set_labels))
        .route("/members", put(set_members));

    Router::new().nest("/cards/{card}", card_router)
}
