use axum::{
    Extension, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    activity::ActivityEvent,
    board::{Board, CreateBoard},
    label::{CreateLabel, Label},
    list::CreateList,
};
use serde::Deserialize;
use services::services::reorder::{BoardSnapshot, ListMutation};
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{
    AppState,
    error::ApiError,
    extract::{ApiJson, ApiQuery},
    middleware::Actor,
};

#[derive(Debug, Deserialize, TS)]
pub struct ActivityQuery {
    /// Only events with a sequence number greater than this.
    #[serde(default)]
    pub after: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// GET /api/boards
pub async fn list_boards(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<Board>>>, ApiError> {
    let boards = state.reorder().list_boards().await?;
    Ok(ResponseJson(ApiResponse::success(boards)))
}

/// POST /api/boards
pub async fn create_board(
    State(state): State<AppState>,
    Extension(Actor(actor_id)): Extension<Actor>,
    ApiJson(payload): ApiJson<CreateBoard>,
) -> Result<ResponseJson<ApiResponse<Board>>, ApiError> {
    let board = state
        .reorder()
        .create_board(&payload, Some(actor_id))
        .await?;
    Ok(ResponseJson(ApiResponse::success(board)))
}

/// GET /api/boards/{board}
pub async fn get_board(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<ResponseJson<ApiResponse<Board>>, ApiError> {
    let board = state.reorder().get_board(&board).await?;
    Ok(ResponseJson(ApiResponse::success(board)))
}

/// DELETE /api/boards/{board} - removes the board and everything on it
pub async fn destroy_board(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.reorder().destroy_board(&board).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

/// GET /api/boards/{board}/snapshot
pub async fn snapshot(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<ResponseJson<ApiResponse<BoardSnapshot>>, ApiError> {
    let snapshot = state.reorder().board_snapshot(&board).await?;
    Ok(ResponseJson(ApiResponse::success(snapshot)))
}

/// GET /api/boards/{board}/activity?after=&limit=
pub async fn activity(
    State(state): State<AppState>,
    Path(board): Path<String>,
    ApiQuery(query): ApiQuery<ActivityQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<ActivityEvent>>>, ApiError> {
    let events = state
        .reorder()
        .activity(&board, query.after, query.limit)
        .await?;
    Ok(ResponseJson(ApiResponse::success(events)))
}

/// POST /api/boards/{board}/lists
pub async fn create_list(
    State(state): State<AppState>,
    Extension(Actor(actor_id)): Extension<Actor>,
    Path(board): Path<String>,
    ApiJson(payload): ApiJson<CreateList>,
) -> Result<ResponseJson<ApiResponse<ListMutation>>, ApiError> {
    let created = state
        .reorder()
        .create_list(&board, &payload, Some(actor_id))
        .await?;
    Ok(ResponseJson(ApiResponse::success(created)))
}

pub async fn list_labels(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<ResponseJson<ApiResponse<Vec<Label>>>, ApiError> {
    let labels = state.reorder().list_labels(&board).await?;
    Ok(ResponseJson(ApiResponse::success(labels)))
}

pub async fn create_label(
    State(state): State<AppState>,
    Path(board): Path<String>,
    ApiJson(payload): ApiJson<CreateLabel>,
) -> Result<ResponseJson<ApiResponse<Label>>, ApiError> {
    let label = state.reorder().create_label(&board, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(label)))
}

pub fn router() -> Router<AppState> {
    let board_router = Router::new()
        .route("/", get(get_board).delete(destroy_board))
        .route("/snapshot", get(snapshot))
        .route("/activity", get(activity))
        .route("/lists", post(create_list))
        .route("/labels", get(list_labels).post(create_label));

    let inner = Router::new()
        .route("/", get(list_boards).post(create_board))
        .nest("/{board}", board_router);

    Router::new().nest("/boards", inner)
}
