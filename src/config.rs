//! Configuration

use std::path::PathBuf;

use crate::camera::CameraConfig;
use crate::{Error, Result};

/// Default pending-task bound for the speech queue
const DEFAULT_SPEECH_CAPACITY: usize = 8;

/// Default event history ring size
const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Controller configuration, assembled from the environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the persisted state file
    pub state_path: PathBuf,

    /// Event history ring size
    pub history_capacity: usize,

    /// Speech configuration
    pub speech: SpeechConfig,

    /// Voice input configuration
    pub voice: VoiceConfig,

    /// Configured cameras (from `HEARTH_CAMERAS`)
    pub cameras: Vec<CameraConfig>,

    /// Chat model configuration
    pub chat: ChatConfig,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Optional bearer token for mutating endpoints (from `HEARTH_API_KEY`)
    pub api_key: Option<String>,
}

/// Speech output configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Pending-task bound for the queue
    pub queue_capacity: usize,

    /// TTS model identifier
    pub tts_model: String,

    /// Default TTS voice when a task names none
    pub default_voice: String,

    /// `OpenAI` API key; without it speech falls back to espeak
    pub openai_api_key: Option<String>,

    /// Override for the espeak binary path
    pub espeak_command: Option<String>,
}

/// Voice input configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Enable the microphone listener at startup
    pub enabled: bool,

    /// Wake words, lowercase
    pub wake_words: Vec<String>,

    /// STT model identifier
    pub stt_model: String,
}

/// Chat model configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Ollama base URL; when unset the rule fallback answers everything
    pub ollama_url: Option<String>,

    /// Ollama model name
    pub model: String,
}

impl Config {
    /// Load configuration from `HEARTH_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a malformed `HEARTH_CAMERAS` value.
    pub fn load() -> Result<Self> {
        Self::load_with_options(false)
    }

    /// Load configuration with an explicit voice disable override
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a malformed `HEARTH_CAMERAS` value.
    pub fn load_with_options(disable_voice: bool) -> Result<Self> {
        // Data directory (~/.local/share/hearth on Linux)
        let data_dir = directories::ProjectDirs::from("dev", "hearth", "hearth")
            .map_or_else(|| PathBuf::from("."), |d| d.data_dir().to_path_buf());
        std::fs::create_dir_all(&data_dir).ok();

        let state_path = std::env::var("HEARTH_STATE_PATH")
            .map_or_else(|_| data_dir.join("state.json"), PathBuf::from);

        let history_capacity = std::env::var("HEARTH_HISTORY_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HISTORY_CAPACITY);

        let speech = SpeechConfig {
            queue_capacity: std::env::var("HEARTH_SPEECH_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SPEECH_CAPACITY),
            tts_model: std::env::var("HEARTH_TTS_MODEL")
                .unwrap_or_else(|_| "tts-1".to_string()),
            default_voice: std::env::var("HEARTH_TTS_VOICE")
                .unwrap_or_else(|_| "alloy".to_string()),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            espeak_command: std::env::var("HEARTH_ESPEAK_COMMAND").ok(),
        };

        let voice = VoiceConfig {
            enabled: !disable_voice
                && std::env::var("HEARTH_VOICE_ENABLED")
                    .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            wake_words: std::env::var("HEARTH_WAKE_WORDS")
                .unwrap_or_else(|_| "hey robot".to_string())
                .split(',')
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
            stt_model: std::env::var("HEARTH_STT_MODEL")
                .unwrap_or_else(|_| "whisper-1".to_string()),
        };

        if disable_voice {
            tracing::info!("voice explicitly disabled via --disable-voice");
        }

        let cameras = parse_cameras(
            &std::env::var("HEARTH_CAMERAS").unwrap_or_else(|_| "head=/dev/video0".to_string()),
        )?;

        let chat = ChatConfig {
            ollama_url: std::env::var("HEARTH_OLLAMA_URL").ok().filter(|u| !u.is_empty()),
            model: std::env::var("HEARTH_OLLAMA_MODEL")
                .unwrap_or_else(|_| "llama3.2".to_string()),
        };

        let api_server = ApiServerConfig {
            port: std::env::var("HEARTH_PORT")
                .or_else(|_| std::env::var("PORT"))
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8778),
            api_key: std::env::var("HEARTH_API_KEY").ok().filter(|k| !k.is_empty()),
        };

        Ok(Self {
            state_path,
            history_capacity,
            speech,
            voice,
            cameras,
            chat,
            api_server,
        })
    }
}

/// Parse the camera list:
/// `name=/dev/videoN[@WxH]` entries separated by commas
fn parse_cameras(raw: &str) -> Result<Vec<CameraConfig>> {
    let mut cameras = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, rest) = entry
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("camera entry '{entry}' is missing '='")))?;

        let (device, size) = match rest.split_once('@') {
            Some((device, size)) => (device, Some(size)),
            None => (rest, None),
        };

        let (width, height) = match size {
            None => (640, 480),
            Some(size) => {
                let (w, h) = size.split_once('x').ok_or_else(|| {
                    Error::Config(format!("camera size '{size}' is not WxH"))
                })?;
                let width = w
                    .parse()
                    .map_err(|_| Error::Config(format!("bad camera width '{w}'")))?;
                let height = h
                    .parse()
                    .map_err(|_| Error::Config(format!("bad camera height '{h}'")))?;
                (width, height)
            }
        };

        cameras.push(CameraConfig {
            name: name.trim().to_string(),
            device: device.trim().to_string(),
            width,
            height,
        });
    }
    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_entries_parse_with_and_without_size() {
        let cameras =
            parse_cameras("head=/dev/video0, rear=/dev/video2@1280x720").unwrap();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].name, "head");
        assert_eq!(cameras[0].device, "/dev/video0");
        assert_eq!((cameras[0].width, cameras[0].height), (640, 480));
        assert_eq!(cameras[1].name, "rear");
        assert_eq!((cameras[1].width, cameras[1].height), (1280, 720));
    }

    #[test]
    fn malformed_camera_entries_are_config_errors() {
        assert!(matches!(parse_cameras("just-a-name"), Err(Error::Config(_))));
        assert!(matches!(
            parse_cameras("head=/dev/video0@wide"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn empty_camera_list_is_allowed() {
        assert!(parse_cameras("").unwrap().is_empty());
    }
}
