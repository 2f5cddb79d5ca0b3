//! HTTP API server
//!
//! The only async layer in the controller. Handlers delegate to the
//! thread-based services and bridge into them with `spawn_blocking` where a
//! call would block the runtime.

mod auth;
mod robot;
mod stream;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::agent::ChatClient;
use crate::camera::FrameBroadcaster;
use crate::metrics::MetricsService;
use crate::speech::SpeechQueue;
use crate::state::StateStore;
use crate::voice::VoiceInput;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<StateStore>,
    pub speech: Arc<SpeechQueue>,
    pub cameras: Arc<FrameBroadcaster>,
    /// Absent when voice input is disabled
    pub voice: Option<Arc<VoiceInput>>,
    pub chat: Arc<ChatClient>,
    pub metrics: Arc<MetricsService>,
    /// Bearer token for every route except `/health`; `None` allows everything
    pub api_key: Option<String>,
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub fn new(state: ApiState, port: u16) -> Self {
        Self {
            state: Arc::new(state),
            port,
        }
    }

    /// Build the router with all routes
    fn router(&self) -> Router {
        // Every API and stream route sits behind the bearer check; state
        // snapshots and camera video are as sensitive as the writes. Only
        // the liveness probe stays open.
        let protected = Router::new()
            .route("/api/state", get(robot::get_state).post(robot::patch_state))
            .route("/api/metrics", get(robot::metrics))
            .route("/api/speak", post(robot::speak))
            .route("/api/speech", get(robot::speech_status))
            .route("/api/cameras", get(robot::list_cameras))
            .route("/api/cameras/{name}/start", post(robot::start_camera))
            .route("/api/cameras/{name}/stop", post(robot::stop_camera))
            .route("/api/chat", post(robot::chat))
            .route("/api/conversation", get(robot::conversation))
            .route("/api/voice/start", post(robot::start_voice))
            .route("/api/voice/stop", post(robot::stop_voice))
            .route("/api/voice/status", get(robot::voice_status))
            .route("/stream/events", get(stream::events))
            .route("/stream/camera/{name}", get(stream::camera))
            .layer(axum::middleware::from_fn_with_state(
                self.state.clone(),
                auth::require_api_key,
            ));

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(robot::health))
            .merge(protected)
            .with_state(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Router with state applied, for in-process tests
    #[must_use]
    pub fn into_router(self) -> Router {
        self.router()
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
