//! Axum Handlers for the REST API
//!
//! Everything interactive runs over WebSockets; the REST surface is a health
//! check and the one-shot persona probe.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use personaverse_core::{GenerationError, ProbeError, probe::probe_persona};
use std::sync::Arc;
use tracing::{error, warn};

use crate::{
    models::{ErrorResponse, ProbePayload, ProbeResponse},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    Generation(GenerationError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Generation(err) => {
                let status = if err.is_quota() {
                    warn!("Generation quota exceeded: {}", err);
                    StatusCode::TOO_MANY_REQUESTS
                } else {
                    error!("Generation failed: {:?}", err);
                    StatusCode::BAD_GATEWAY
                };
                let message = ProbeError::Generation(err).user_message();
                (status, Json(ErrorResponse { message })).into_response()
            }
        }
    }
}

impl From<ProbeError> for ApiError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::EmptyQuery => Self::BadRequest(err.to_string()),
            ProbeError::Generation(e) => Self::Generation(e),
        }
    }
}

/// Liveness check.
pub async fn health() -> &'static str {
    "ok"
}

/// Asks a persona one question and returns its in-character answer.
pub async fn probe(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProbePayload>,
) -> Result<Json<ProbeResponse>, ApiError> {
    let text = probe_persona(state.generator.as_ref(), &payload.persona, &payload.prompt).await?;
    Ok(Json(ProbeResponse { text }))
}
