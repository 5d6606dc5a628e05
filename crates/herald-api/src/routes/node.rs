//! Node information endpoints.
//!
//! `/api/v1/node/info` serves operators and clients; the well-known document
//! is the discovery surface consumed by remote peers.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

use herald_common::error::HeraldResult;
use herald_federation::types::{NodeDiscoveryDocument, NodeStatistics};

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/node/info", get(node_info))
}

/// The well-known route lives at the server root, outside `/api/v1`.
pub fn well_known_router() -> Router<Arc<AppState>> {
    Router::new().route("/.well-known/herald-node", get(well_known))
}

#[derive(Debug, Serialize)]
struct NodeInfoResponse {
    domain: String,
    version: String,
    federation_enabled: bool,
    registration_open: bool,
    max_users: u32,
    current_users: i64,
    federated_nodes: i64,
}

/// `GET /api/v1/node/info`
///
/// Public endpoint that provides information about this node.
async fn node_info(State(state): State<Arc<AppState>>) -> HeraldResult<Json<NodeInfoResponse>> {
    let current_users = state.db.identities.count_local().await?;
    let federated_nodes = state.db.nodes.count_active().await?;

    Ok(Json(NodeInfoResponse {
        domain: state.config.server.domain.clone(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        federation_enabled: state.config.server.federation_enabled,
        registration_open: state.config.server.registration_open,
        max_users: state.config.server.max_users,
        current_users,
        federated_nodes,
    }))
}

/// `GET /.well-known/herald-node`
///
/// Discovery document used by peers performing `discover`. Statistics are
/// aggregate and non-PII.
async fn well_known(
    State(state): State<Arc<AppState>>,
) -> HeraldResult<Json<NodeDiscoveryDocument>> {
    let domain = &state.config.server.domain;
    let user_count = state.db.identities.count_local().await?;
    let federated_nodes = state.db.nodes.count_active().await?;

    Ok(Json(NodeDiscoveryDocument {
        version: "1.0".to_owned(),
        domain: domain.clone(),
        federation_api: format!("https://{domain}/api/federation"),
        public_key: None,
        capabilities: vec![
            "text_messages".to_owned(),
            "image_sharing".to_owned(),
            "file_sharing".to_owned(),
        ],
        max_message_size: state.config.limits.max_message_size_bytes,
        statistics: NodeStatistics { user_count, federated_nodes },
    }))
}
