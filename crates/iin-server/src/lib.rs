//! IIN agent server library logic.

pub mod api;
pub mod background;
pub mod config;
pub mod ledger;
pub mod transport;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use iin_db::DbPool;
use iin_protocol::IinAgent;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// The protocol agent serving the RPCs.
    pub agent: IinAgent,
}

/// Health check handler.
///
/// Returns `200 OK` with server status and version.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let rpc_routes = Router::new()
        .route(
            "/SyncExternalState",
            post(api::sync_external_state_handler),
        )
        .route(
            "/RequestIdentityConfiguration",
            post(api::request_identity_configuration_handler),
        )
        .route(
            "/SendIdentityConfiguration",
            post(api::send_identity_configuration_handler),
        )
        .route(
            "/RequestAttestation",
            post(api::request_attestation_handler),
        )
        .route("/SendAttestation", post(api::send_attestation_handler))
        .route("/memberships", get(api::list_memberships_handler))
        .route(
            "/memberships/{securityDomain}",
            get(api::get_membership_handler),
        )
        .route(
            "/memberships/{securityDomain}/history",
            get(api::membership_history_handler),
        );

    Router::new()
        .route("/health", get(health))
        .nest(transport::RPC_PREFIX, rpc_routes)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
