//! Inbound server-to-server federation routes.
//!
//! These endpoints are accessed by *remote Herald nodes*, not by end-user
//! clients, and live under `/api/federation` — the entry point advertised in
//! the well-known discovery document.
//!
//! ## Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST   | `/api/federation/messages` | Receive a delivery envelope from a remote node |
//! | GET    | `/api/federation/identities/{handle}` | Serve key material for a local identity |

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use herald_common::error::{HeraldError, HeraldResult};
use herald_common::handle::parse_handle;
use herald_federation::types::{DeliveryEnvelope, DeliveryReceipt, RemoteIdentity};

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/messages", post(receive_message))
        .route("/identities/{handle}", get(lookup_identity))
}

/// `POST /api/federation/messages`
///
/// The receiving side of the outbound transport. Acknowledges idempotently:
/// a redelivered envelope gets a fresh receipt for the original record.
async fn receive_message(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<DeliveryEnvelope>,
) -> HeraldResult<Json<DeliveryReceipt>> {
    if !state.config.server.federation_enabled {
        return Err(HeraldError::Forbidden);
    }

    info!(
        "Inbound envelope {} from {} for {}",
        envelope.message_id, envelope.origin_node, envelope.recipient_handle
    );
    let message = state.lifecycle.receive_federated(&envelope).await?;

    Ok(Json(DeliveryReceipt {
        message_id: message.id,
        accepted: true,
        received_at: message.delivered_at.unwrap_or(Utc::now()),
    }))
}

/// `GET /api/federation/identities/{handle}`
///
/// The receiving side of remote identity lookup: serves current key material
/// for an identity hosted here. 404 is load-bearing — it tells the caller
/// "never existed", as opposed to unreachability.
async fn lookup_identity(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> HeraldResult<Json<RemoteIdentity>> {
    if !state.config.server.federation_enabled {
        return Err(HeraldError::Forbidden);
    }

    let handle = parse_handle(&raw)?;
    if !handle.is_local_to(&state.config.server.domain) {
        return Err(HeraldError::IdentityNotFound { handle: raw });
    }

    let identity = state
        .db
        .identities
        .find_by_handle(&handle.local_part, &handle.domain)
        .await?
        .filter(|i| i.is_local)
        .ok_or(HeraldError::IdentityNotFound { handle: raw })?;

    Ok(Json(RemoteIdentity {
        handle: identity.handle().to_string(),
        public_key: identity.public_key,
        public_key_fingerprint: identity.public_key_fingerprint,
        avatar_url: identity.avatar_url,
        status_message: identity.status_message,
    }))
}
