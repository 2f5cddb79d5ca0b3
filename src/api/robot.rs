//! REST handlers for robot control

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::ApiState;
use crate::Error;

/// An [`Error`] with its HTTP wire shape
///
/// Every handler error becomes `{"error": {"code", "message"}}` with a
/// status that tells the caller whether to fix the request (400), back off
/// (429), or check the name (404).
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            Error::CapacityExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, "capacity_exceeded"),
            Error::UnknownResource(_) => (StatusCode::NOT_FOUND, "not_found"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = json!({"error": {"code": code, "message": self.0.to_string()}});
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Liveness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Current state snapshot
pub async fn get_state(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(state.store.snapshot())
}

/// Merge a patch into the state; returns the new snapshot
pub async fn patch_state(
    State(state): State<Arc<ApiState>>,
    Json(patch): Json<Map<String, Value>>,
) -> Json<Value> {
    Json(state.store.update(patch))
}

/// Host metrics, served through the sample cache
pub async fn metrics(State(state): State<Arc<ApiState>>) -> Json<crate::metrics::Metrics> {
    Json(state.metrics.sample())
}

#[derive(Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Queue an utterance; 429 when the queue is full
pub async fn speak(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SpeakRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.speech.enqueue(&req.text, req.voice)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"id": task.id, "queued_at": task.created_at})),
    ))
}

/// Active task plus pending FIFO
pub async fn speech_status(
    State(state): State<Arc<ApiState>>,
) -> Json<crate::speech::SpeechStatus> {
    Json(state.speech.status())
}

/// Configured cameras and their activity
pub async fn list_cameras(
    State(state): State<Arc<ApiState>>,
) -> Json<Vec<crate::camera::CameraInfo>> {
    Json(state.cameras.list())
}

/// Start the named camera feed
pub async fn start_camera(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.cameras.ensure_started(&name)?;
    Ok(Json(json!({"name": name, "active": true})))
}

/// Stop the named camera feed
pub async fn stop_camera(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.cameras.stop(&name)?;
    Ok(Json(json!({"name": name, "active": false})))
}

#[derive(Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// One chat turn; the model call blocks, so it runs off the runtime
pub async fn chat(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<Value>, ApiError> {
    let chat = Arc::clone(&state.chat);
    let reply = tokio::task::spawn_blocking(move || chat.chat(&req.message))
        .await
        .map_err(|e| Error::Chat(format!("chat task panicked: {e}")))??;
    Ok(Json(json!({"reply": reply})))
}

/// Retained conversation turns, oldest first
pub async fn conversation(
    State(state): State<Arc<ApiState>>,
) -> Json<Vec<crate::agent::ChatMessage>> {
    Json(state.chat.conversation())
}

/// Start the microphone listener
pub async fn start_voice(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    let voice = state
        .voice
        .clone()
        .ok_or_else(|| Error::Validation("voice input is disabled".to_string()))?;
    tokio::task::spawn_blocking(move || voice.start())
        .await
        .map_err(|e| Error::Audio(format!("voice start panicked: {e}")))??;
    Ok(Json(json!({"listening": true})))
}

/// Stop the microphone listener
pub async fn stop_voice(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    let voice = state
        .voice
        .clone()
        .ok_or_else(|| Error::Validation("voice input is disabled".to_string()))?;
    tokio::task::spawn_blocking(move || voice.stop())
        .await
        .map_err(|e| Error::Audio(format!("voice stop panicked: {e}")))?;
    Ok(Json(json!({"listening": false})))
}

/// Whether the listener is running
pub async fn voice_status(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let listening = state.voice.as_ref().is_some_and(|v| v.is_listening());
    Json(json!({"listening": listening}))
}
