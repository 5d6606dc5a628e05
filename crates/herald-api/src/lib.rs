//! # herald-api
//!
//! The HTTP request boundary of a Herald node: client-facing message
//! endpoints, node information, and the inbound half of server-to-server
//! federation. Handlers deserialize and authenticate, then call into
//! `herald-messaging`; no business logic lives here.

pub mod auth;
pub mod routes;

use axum::Router;
use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_db::Database;
use herald_federation::registry::NodeRegistry;
use herald_messaging::{IdentityResolver, MessageLifecycle};

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    /// The message lifecycle core; owns every message state transition.
    pub lifecycle: Arc<MessageLifecycle>,
    /// Handle and identifier resolution (local vs. federated).
    pub resolver: Arc<IdentityResolver>,
    /// Reachability ledger for remote peers.
    pub registry: Arc<NodeRegistry>,
    pub config: Arc<AppConfig>,
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .merge(routes::messages::router())
        .merge(routes::node::router())
        .merge(routes::health::router());

    Router::new()
        .nest("/api/v1", api_routes)
        // Server-to-server endpoints live at the advertised federation entry
        // point, outside the client prefix.
        .nest("/api/federation", routes::federation::router())
        .merge(routes::node::well_known_router())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}
