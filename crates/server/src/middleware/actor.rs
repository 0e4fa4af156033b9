use axum::{
    extract::Request,
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use services::services::board_api::ACTOR_HEADER;
use uuid::Uuid;

use crate::error::ApiError;

/// The authenticated caller, inserted into request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor(pub Uuid);

fn actor_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    let value = headers.get(ACTOR_HEADER)?.to_str().ok()?;
    Uuid::parse_str(value.trim()).ok()
}

/// Rejects requests without a valid `X-Actor-Id`.
pub async fn require_actor(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let Some(actor_id) = actor_from_headers(req.headers()) else {
        tracing::debug!(uri = %req.uri(), "Rejected request without actor");
        return Err(ApiError::Unauthorized);
    };
    req.extensions_mut().insert(Actor(actor_id));
    Ok(next.run(req).await)
}
