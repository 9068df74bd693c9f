//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application: the
//! REST endpoints and the two WebSocket surfaces.

use crate::{
    handlers,
    state::AppState,
    ws::{chat_handler, playground_handler},
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/probe", post(handlers::probe))
        .route("/ws/playground", get(playground_handler))
        .route("/ws/chat", get(chat_handler))
        .with_state(app_state)
}
