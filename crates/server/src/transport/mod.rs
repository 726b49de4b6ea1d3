// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Boundary adapter: REST routes and the WebSocket upgrade, both served
//! from the same listener.

pub mod http;
pub mod ws;
pub mod ws_msg;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;

/// Build the full application router.
pub fn build_router(orch: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/health", get(http::health))
        .route("/sessions", get(http::list_sessions).post(http::create_session))
        .route("/sessions/{id}", get(http::session_details).delete(http::delete_session))
        .route("/sessions/{id}/status", get(http::session_status))
        .route("/sessions/{id}/messages", post(http::enqueue_message))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(orch)
}
