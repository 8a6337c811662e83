//! Signaling endpoints for the audio spy.
//!
//! Two-step exchange: `POST /spy/{call_id}` creates (or joins) the backend
//! source and returns a server-generated SDP offer; the browser replies with
//! its answer via `POST /spy/answer/{session_id}`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::server::spy::SpyError;

use super::handlers::error_response;
use super::routes::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SpyRequest {
    #[serde(default)]
    pub from_tag: Option<String>,
    #[serde(default)]
    pub to_tag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SpyResponse {
    #[serde(rename = "spyID")]
    pub spy_id: Uuid,
    pub sdp: String,
    pub from_tag: String,
    pub to_tag: String,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub sdp: String,
}

impl IntoResponse for SpyError {
    fn into_response(self) -> Response {
        let status = match &self {
            SpyError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            SpyError::NotEnoughTags
            | SpyError::Engine(_)
            | SpyError::WebRtc(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.to_string())
    }
}

/// POST /spy/{call_id}
///
/// The body is optional JSON with explicit leg tags; an empty or absent body
/// means both tags are auto-detected from the engine.
pub async fn start_spy(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    body: Bytes,
) -> Response {
    let request: SpyRequest = if body.is_empty() {
        SpyRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid request body: {e}"),
                )
            }
        }
    };

    match state
        .spy
        .start_session(&call_id, request.from_tag, request.to_tag)
        .await
    {
        Ok(offer) => Json(SpyResponse {
            spy_id: offer.session_id,
            sdp: offer.sdp,
            from_tag: offer.from_tag,
            to_tag: offer.to_tag,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /spy/answer/{session_id}
pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<AnswerRequest>,
) -> Result<StatusCode, SpyError> {
    state.spy.handle_answer(session_id, request.sdp).await?;
    Ok(StatusCode::OK)
}
