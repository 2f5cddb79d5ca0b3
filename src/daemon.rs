//! Daemon wiring and lifecycle
//!
//! Builds every subsystem once, hands shared handles to the HTTP layer, and
//! owns the shutdown order: voice first so no new commands arrive, then the
//! coordinator, then the speech worker, then the camera feeds.

use std::sync::Arc;
use std::sync::mpsc;

use crate::Result;
use crate::agent::{ChatClient, Coordinator, OllamaConfig};
use crate::api::{ApiServer, ApiState};
use crate::camera::FrameBroadcaster;
use crate::config::{Config, SpeechConfig};
use crate::metrics::MetricsService;
use crate::speech::{EspeakSpeech, OpenAiSpeech, SpeechEngine, SpeechQueue};
use crate::state::StateStore;
use crate::voice::{KeywordDetector, VoiceInput, WhisperTranscriber};

/// The assembled controller
pub struct Daemon {
    config: Config,
    store: Arc<StateStore>,
    speech: Arc<SpeechQueue>,
    cameras: Arc<FrameBroadcaster>,
    voice: Option<Arc<VoiceInput>>,
    chat: Arc<ChatClient>,
    coordinator: Coordinator,
    metrics: Arc<MetricsService>,
}

/// Pick a speech engine: the OpenAI API when a key and a speaker exist,
/// espeak otherwise
#[must_use]
pub fn build_speech_engine(config: &SpeechConfig) -> Box<dyn SpeechEngine> {
    if let Some(key) = &config.openai_api_key {
        match OpenAiSpeech::new(key.clone(), config.tts_model.clone()) {
            Ok(engine) => {
                tracing::info!(model = %config.tts_model, "using OpenAI speech");
                return Box::new(engine);
            }
            Err(e) => {
                tracing::warn!(error = %e, "OpenAI speech unavailable, falling back to espeak");
            }
        }
    }
    Box::new(EspeakSpeech::new(config.espeak_command.clone()))
}

impl Daemon {
    /// Build every subsystem from configuration
    ///
    /// # Errors
    ///
    /// Returns error when a required subsystem cannot be constructed.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(StateStore::open(
            config.state_path.clone(),
            config.history_capacity,
        ));

        let engine = build_speech_engine(&config.speech);
        let speech = SpeechQueue::start(
            Arc::clone(&store),
            engine,
            config.speech.queue_capacity,
            config.speech.default_voice.clone(),
        );

        let cameras = Arc::new(FrameBroadcaster::new(config.cameras.clone()));

        let chat = Arc::new(ChatClient::new(
            Arc::clone(&store),
            config.chat.ollama_url.clone().map(|base_url| OllamaConfig {
                base_url,
                model: config.chat.model.clone(),
            }),
        ));

        let (command_tx, command_rx) = mpsc::channel();
        let coordinator =
            Coordinator::start(command_rx, Arc::clone(&chat), Arc::clone(&speech));

        // Voice needs a transcriber; without an OpenAI key it stays off
        let voice = match &config.speech.openai_api_key {
            Some(key) => {
                let transcriber =
                    WhisperTranscriber::new(key.clone(), config.voice.stt_model.clone())?;
                let detector = KeywordDetector::new(config.voice.wake_words.clone());
                Some(Arc::new(VoiceInput::new(
                    Arc::clone(&store),
                    Arc::new(transcriber),
                    Arc::new(detector),
                    command_tx,
                )))
            }
            None => {
                tracing::info!("no OpenAI API key, voice input unavailable");
                None
            }
        };

        Ok(Self {
            config,
            store,
            speech,
            cameras,
            voice,
            chat,
            coordinator,
            metrics: Arc::new(MetricsService::new()),
        })
    }

    /// Run until interrupted, then shut subsystems down in order
    ///
    /// # Errors
    ///
    /// Returns error when the API server fails to start.
    pub async fn run(self) -> Result<()> {
        if self.config.voice.enabled {
            if let Some(voice) = &self.voice {
                let voice = Arc::clone(voice);
                let started =
                    tokio::task::spawn_blocking(move || voice.start()).await;
                match started {
                    Ok(Ok(())) => {
                        tracing::info!(
                            wake_words = ?self.config.voice.wake_words,
                            "voice input listening"
                        );
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "voice input did not start"),
                    Err(e) => tracing::error!(error = %e, "voice start task failed"),
                }
            }
        }

        let state = ApiState {
            store: Arc::clone(&self.store),
            speech: Arc::clone(&self.speech),
            cameras: Arc::clone(&self.cameras),
            voice: self.voice.clone(),
            chat: Arc::clone(&self.chat),
            metrics: Arc::clone(&self.metrics),
            api_key: self.config.api_server.api_key.clone(),
        };
        let server = ApiServer::new(state, self.config.api_server.port).spawn();

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| crate::Error::Config(format!("signal handler failed: {e}")))?;
        tracing::info!("shutting down");

        let Self {
            voice,
            coordinator,
            speech,
            cameras,
            ..
        } = self;
        tokio::task::spawn_blocking(move || {
            if let Some(voice) = &voice {
                voice.stop();
            }
            coordinator.shutdown();
            speech.shutdown();
            cameras.stop_all();
        })
        .await
        .map_err(|e| crate::Error::Config(format!("shutdown task failed: {e}")))?;

        server.abort();
        Ok(())
    }
}
