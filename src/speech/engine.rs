//! Speech synthesis engines
//!
//! One capability interface, [`SpeechEngine`], implemented by each concrete
//! backend. The engine is chosen once at startup; the worker loop never
//! branches on provider names.

use serde::Serialize;

use super::playback::SpeakerOutput;
use crate::{Error, Result};

/// Synthesizes and plays one utterance; owns its playback path
///
/// Implementations block until the audio has finished. The speech worker is
/// the only caller, so playback is naturally serialized on the one device.
pub trait SpeechEngine: Send {
    /// Speak `text` with the given voice identifier
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis or playback fails.
    fn speak(&self, text: &str, voice: &str) -> Result<()>;
}

/// OpenAI speech API request body
#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
}

/// OpenAI speech API backend, played through the local speaker
pub struct OpenAiSpeech {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    output: SpeakerOutput,
}

impl OpenAiSpeech {
    /// Create the engine, probing the output device up front
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is empty or no output device exists.
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }
        Ok(Self {
            client: reqwest::blocking::Client::new(),
            api_key,
            model,
            output: SpeakerOutput::new()?,
        })
    }
}

impl SpeechEngine for OpenAiSpeech {
    fn speak(&self, text: &str, voice: &str) -> Result<()> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes()?;
        self.output.play_mp3(&audio)
    }
}

/// Offline fallback that shells out to `espeak`
///
/// Used when no TTS API key is configured; espeak drives the audio device
/// itself, so no decode/playback path is needed here.
pub struct EspeakSpeech {
    command: String,
}

impl EspeakSpeech {
    #[must_use]
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.unwrap_or_else(|| "espeak".to_string()),
        }
    }
}

impl SpeechEngine for EspeakSpeech {
    fn speak(&self, text: &str, _voice: &str) -> Result<()> {
        let status = std::process::Command::new(&self.command)
            .arg(text)
            .status()
            .map_err(|e| Error::Tts(format!("failed to run {}: {e}", self.command)))?;
        if !status.success() {
            return Err(Error::Tts(format!("{} exited with {status}", self.command)));
        }
        Ok(())
    }
}
