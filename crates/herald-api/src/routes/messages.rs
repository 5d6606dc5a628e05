//! Message routes — send, conversation retrieval, read acknowledgement.
//!
//! ## Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST   | `/api/v1/messages` | Send a message to a handle or group |
//! | GET    | `/api/v1/messages/conversation/{handle}` | Page through a conversation |
//! | PUT    | `/api/v1/messages/{id}/read` | Acknowledge receipt |

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use herald_common::error::HeraldResult;
use herald_common::models::message::{ConversationPage, MessageResponse, SendMessageRequest};

use crate::auth::AuthIdentity;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/messages", post(send_message))
        .route("/messages/conversation/{handle}", get(get_conversation))
        .route("/messages/{id}/read", put(mark_read))
}

/// `POST /api/v1/messages`
///
/// A definitive response either way: 201 with the record (whose state is
/// already `delivered` for local recipients) or a typed rejection. Delivery
/// progress after acceptance is observed by polling, never by blocking here.
async fn send_message(
    State(state): State<Arc<AppState>>,
    AuthIdentity(sender): AuthIdentity,
    Json(body): Json<SendMessageRequest>,
) -> HeraldResult<(StatusCode, Json<MessageResponse>)> {
    let message = state.lifecycle.send(&sender, &body).await?;
    Ok((StatusCode::CREATED, Json(message.into())))
}

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    limit: Option<u32>,
    /// Strict upper bound on `created_at`; pass the previous page's
    /// `next_cursor`.
    before: Option<DateTime<Utc>>,
}

/// `GET /api/v1/messages/conversation/{handle}?limit=&before=`
async fn get_conversation(
    State(state): State<Arc<AppState>>,
    AuthIdentity(caller): AuthIdentity,
    Path(handle): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> HeraldResult<Json<ConversationPage>> {
    let page = state
        .lifecycle
        .conversation(&caller, &handle, query.limit, query.before)
        .await?;
    Ok(Json(page))
}

/// `PUT /api/v1/messages/{id}/read`
async fn mark_read(
    State(state): State<Arc<AppState>>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<Uuid>,
) -> HeraldResult<Json<MessageResponse>> {
    let message = state.lifecycle.mark_read(id, caller.id).await?;
    Ok(Json(message.into()))
}
