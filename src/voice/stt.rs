//! Speech-to-text

use crate::{Error, Result};

/// Turns a WAV utterance into text
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stt`] when the backend fails or rejects the audio.
    fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// OpenAI Whisper over the transcription API
pub struct WhisperTranscriber {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
}

impl WhisperTranscriber {
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the API key is empty.
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::blocking::Client::new(),
            api_key,
            model,
        })
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting transcription");

        let form = reqwest::blocking::multipart::Form::new()
            .part(
                "file",
                reqwest::blocking::multipart::Part::bytes(wav.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json()?;
        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}
