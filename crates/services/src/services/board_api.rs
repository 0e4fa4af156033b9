//! The board operations a client needs, independent of transport.
//!
//! [`LocalBoardApi`] calls [`ReorderService`] in-process; [`HttpBoardClient`]
//! talks to a running server. Both report failures as [`BoardApiError`].

use std::time::Duration;

use async_trait::async_trait;
use db::models::{
    card::{CreateCard, MoveCard},
    list::{CreateList, MoveList},
};
use reqwest::{Client, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use utils::response::ApiResponse;
use uuid::Uuid;

use super::reorder::{
    BoardSnapshot, CardMutation, DeleteAck, ListMutation, ReorderError, ReorderService,
};

pub const ACTOR_HEADER: &str = "X-Actor-Id";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BoardApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidIndex(String),
    #[error("collection was modified concurrently")]
    ConcurrentModification,
    #[error("unauthorized")]
    Unauthorized,
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error: {0}")]
    Server(String),
}

impl From<ReorderError> for BoardApiError {
    fn from(err: ReorderError) -> Self {
        match err {
            ReorderError::NotFound(kind) => BoardApiError::NotFound(kind.to_string()),
            ReorderError::InvalidIndex(msg) => BoardApiError::InvalidIndex(msg),
            ReorderError::Validation(e) => BoardApiError::InvalidIndex(e.to_string()),
            ReorderError::ConcurrentModification => BoardApiError::ConcurrentModification,
            ReorderError::Database(e) => BoardApiError::Server(e.to_string()),
            ReorderError::Internal(msg) => BoardApiError::Server(msg),
        }
    }
}

#[async_trait]
pub trait BoardApi: Send + Sync {
    async fn snapshot(&self, board: &str) -> Result<BoardSnapshot, BoardApiError>;

    async fn create_list(&self, board: &str, req: &CreateList)
    -> Result<ListMutation, BoardApiError>;

    async fn reorder_list(&self, list: &str, req: &MoveList) -> Result<ListMutation, BoardApiError>;

    async fn delete_list(&self, list: &str) -> Result<DeleteAck, BoardApiError>;

    async fn create_card(&self, list: &str, req: &CreateCard)
    -> Result<CardMutation, BoardApiError>;

    async fn reorder_card(&self, card: &str, req: &MoveCard) -> Result<CardMutation, BoardApiError>;

    async fn delete_card(&self, card: &str) -> Result<DeleteAck, BoardApiError>;
}

/// In-process implementation acting as one actor.
#[derive(Clone)]
pub struct LocalBoardApi {
    service: ReorderService,
    actor_id: Option<Uuid>,
}

impl LocalBoardApi {
    pub fn new(service: ReorderService, actor_id: Option<Uuid>) -> Self {
        Self { service, actor_id }
    }
}

#[async_trait]
impl BoardApi for LocalBoardApi {
    async fn snapshot(&self, board: &str) -> Result<BoardSnapshot, BoardApiError> {
        Ok(self.service.board_snapshot(board).await?)
    }

    async fn create_list(
        &self,
        board: &str,
        req: &CreateList,
    ) -> Result<ListMutation, BoardApiError> {
        Ok(self.service.create_list(board, req, self.actor_id).await?)
    }

    async fn reorder_list(&self, list: &str, req: &MoveList) -> Result<ListMutation, BoardApiError> {
        Ok(self.service.reorder_list(list, req, self.actor_id).await?)
    }

    async fn delete_list(&self, list: &str) -> Result<DeleteAck, BoardApiError> {
        Ok(self.service.delete_list(list, self.actor_id).await?)
    }

    async fn create_card(
        &self,
        list: &str,
        req: &CreateCard,
    ) -> Result<CardMutation, BoardApiError> {
        Ok(self.service.create_card(list, req, self.actor_id).await?)
    }

    async fn reorder_card(&self, card: &str, req: &MoveCard) -> Result<CardMutation, BoardApiError> {
        Ok(self.service.reorder_card(card, req, self.actor_id).await?)
    }

    async fn delete_card(&self, card: &str) -> Result<DeleteAck, BoardApiError> {
        Ok(self.service.delete_card(card, self.actor_id).await?)
    }
}

/// Client for the server's `/api` surface.
#[derive(Debug, Clone)]
pub struct HttpBoardClient {
    http: Client,
    base_url: String,
    actor_id: Uuid,
}

impl HttpBoardClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(base_url: &str, actor_id: Uuid) -> Result<Self, BoardApiError> {
        let http = Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(concat!("tackboard-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BoardApiError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            actor_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, BoardApiError> {
        let url = self.url(path);
        tracing::debug!(url = %url, "GET");
        let response = self
            .http
            .get(&url)
            .header(ACTOR_HEADER, self.actor_id.to_string())
            .send()
            .await
            .map_err(map_reqwest_error)?;
        handle_response(response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BoardApiError> {
        let url = self.url(path);
        tracing::debug!(url = %url, "POST");
        let response = self
            .http
            .post(&url)
            .header(ACTOR_HEADER, self.actor_id.to_string())
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        handle_response(response).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, BoardApiError> {
        let url = self.url(path);
        tracing::debug!(url = %url, "DELETE");
        let response = self
            .http
            .delete(&url)
            .header(ACTOR_HEADER, self.actor_id.to_string())
            .send()
            .await
            .map_err(map_reqwest_error)?;
        handle_response(response).await
    }
}

#[async_trait]
impl BoardApi for HttpBoardClient {
    async fn snapshot(&self, board: &str) -> Result<BoardSnapshot, BoardApiError> {
        self.get(&format!("/boards/{board}/snapshot")).await
    }

    async fn create_list(
        &self,
        board: &str,
        req: &CreateList,
    ) -> Result<ListMutation, BoardApiError> {
        self.post(&format!("/boards/{board}/lists"), req).await
    }

    async fn reorder_list(&self, list: &str, req: &MoveList) -> Result<ListMutation, BoardApiError> {
        self.post(&format!("/lists/{list}/move"), req).await
    }

    async fn delete_list(&self, list: &str) -> Result<DeleteAck, BoardApiError> {
        self.delete(&format!("/lists/{list}")).await
    }

    async fn create_card(
        &self,
        list: &str,
        req: &CreateCard,
    ) -> Result<CardMutation, BoardApiError> {
        self.post(&format!("/lists/{list}/cards"), req).await
    }

    async fn reorder_card(&self, card: &str, req: &MoveCard) -> Result<CardMutation, BoardApiError> {
        self.post(&format!("/cards/{card}/move"), req).await
    }

    async fn delete_card(&self, card: &str) -> Result<DeleteAck, BoardApiError> {
        self.delete(&format!("/cards/{card}")).await
    }
}

async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BoardApiError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BoardApiError::Transport(e.to_string()))?;
    let envelope: Option<ApiResponse<T>> = serde_json::from_str(&body).ok();

    if status.is_success() {
        return envelope
            .and_then(ApiResponse::into_data)
            .ok_or_else(|| BoardApiError::Server(format!("unexpected response body: {body}")));
    }

    let message = envelope
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.clone());
    tracing::warn!(status = status.as_u16(), message = %message, "Board API returned error");
    Err(error_for_status(status, message))
}

fn error_for_status(status: StatusCode, message: String) -> BoardApiError {
    match status {
        StatusCode::NOT_FOUND => BoardApiError::NotFound(message),
        StatusCode::BAD_REQUEST => BoardApiError::InvalidIndex(message),
        StatusCode::CONFLICT => BoardApiError::ConcurrentModification,
        StatusCode::UNAUTHORIZED => BoardApiError::Unauthorized,
        _ => BoardApiError::Server(message),
    }
}

fn map_reqwest_error(e: reqwest::Error) -> BoardApiError {
    if e.is_timeout() {
        BoardApiError::Timeout
    } else {
        BoardApiError::Transport(e.to_string())
    }
}
