//! Wake word confirmation and speech segmentation
//!
//! Detection is split in two: a local [`EnergyGate`] slices the microphone
//! stream into candidate utterances by RMS energy, and a [`WakeWordDetector`]
//! confirms the wake word on the transcript and extracts the command that
//! follows it. The detector is chosen once when voice input is built.

/// RMS energy above which a chunk counts as speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Shortest utterance worth transcribing (0.3 s at 16 kHz)
const MIN_SPEECH_SAMPLES: usize = 4_800;

/// Trailing silence that ends an utterance (0.5 s at 16 kHz)
const SILENCE_SAMPLES: usize = 8_000;

/// Confirms a wake word on a transcript
pub trait WakeWordDetector: Send + Sync {
    /// The command following the wake word, or `None` when no wake word is
    /// present. An utterance that is only the wake word yields an empty
    /// command.
    fn extract(&self, transcript: &str) -> Option<String>;
}

/// Case-insensitive substring matching against a fixed wake word list
pub struct KeywordDetector {
    wake_words: Vec<String>,
}

impl KeywordDetector {
    #[must_use]
    pub fn new(wake_words: Vec<String>) -> Self {
        let wake_words = wake_words
            .into_iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        Self { wake_words }
    }
}

impl WakeWordDetector for KeywordDetector {
    fn extract(&self, transcript: &str) -> Option<String> {
        let normalized = transcript.to_lowercase();
        for wake_word in &self.wake_words {
            if let Some(pos) = normalized.find(wake_word.as_str()) {
                tracing::info!(%wake_word, transcript, "wake word confirmed");
                // Slice the lowercased copy: offsets into the original can
                // differ once case folding changes byte lengths
                let command = normalized[pos + wake_word.len()..]
                    .trim_start_matches([',', '.', '!', '?', ' '])
                    .trim()
                    .to_string();
                return Some(command);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Capturing,
}

/// Slices an audio stream into utterances by energy
///
/// Feed it chunks as they arrive; a complete utterance comes back once
/// enough speech has been followed by enough silence.
pub struct EnergyGate {
    state: GateState,
    buffer: Vec<f32>,
    silence_counter: usize,
}

impl EnergyGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: GateState::Idle,
            buffer: Vec::new(),
            silence_counter: 0,
        }
    }

    /// Feed one chunk of samples; returns a finished utterance if any
    pub fn push(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        let is_speech = rms_energy(samples) > ENERGY_THRESHOLD;

        match self.state {
            GateState::Idle => {
                if is_speech {
                    self.state = GateState::Capturing;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(samples);
                    self.silence_counter = 0;
                }
            }
            GateState::Capturing => {
                self.buffer.extend_from_slice(samples);
                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter > SILENCE_SAMPLES {
                    let segment = std::mem::take(&mut self.buffer);
                    self.reset();
                    if segment.len() > MIN_SPEECH_SAMPLES {
                        tracing::debug!(samples = segment.len(), "utterance complete");
                        return Some(segment);
                    }
                    // Too short to be speech; likely a noise burst
                }
            }
        }
        None
    }

    pub fn reset(&mut self) {
        self.state = GateState::Idle;
        self.buffer.clear();
        self.silence_counter = 0;
    }
}

impl Default for EnergyGate {
    fn default() -> Self {
        Self::new()
    }
}

/// RMS energy of a sample chunk
#[allow(clippy::cast_precision_loss)]
fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_separates_silence_from_speech() {
        assert!(rms_energy(&vec![0.0; 100]) < 0.001);
        assert!(rms_energy(&vec![0.5; 100]) > 0.4);
    }

    #[test]
    fn gate_emits_a_segment_after_speech_then_silence() {
        let mut gate = EnergyGate::new();
        let speech = vec![0.5f32; 1600];
        let silence = vec![0.0f32; 1600];

        // 0.5s of speech
        for _ in 0..5 {
            assert!(gate.push(&speech).is_none());
        }
        // trailing silence ends the utterance
        let mut segment = None;
        for _ in 0..8 {
            if let Some(s) = gate.push(&silence) {
                segment = Some(s);
                break;
            }
        }
        let segment = segment.expect("segment should complete");
        assert!(segment.len() > MIN_SPEECH_SAMPLES);
    }

    #[test]
    fn short_noise_bursts_are_discarded() {
        let mut gate = EnergyGate::new();
        let blip = vec![0.5f32; 800];
        let silence = vec![0.0f32; 1600];

        assert!(gate.push(&blip).is_none());
        for _ in 0..8 {
            assert!(gate.push(&silence).is_none());
        }
    }

    #[test]
    fn pure_silence_never_emits() {
        let mut gate = EnergyGate::new();
        let silence = vec![0.0f32; 1600];
        for _ in 0..20 {
            assert!(gate.push(&silence).is_none());
        }
    }

    #[test]
    fn detector_extracts_the_command_after_the_wake_word() {
        let detector = KeywordDetector::new(vec!["hey robot".to_string()]);
        assert_eq!(
            detector.extract("Hey Robot, turn on the lights"),
            Some("turn on the lights".to_string())
        );
        assert_eq!(detector.extract("hey robot"), Some(String::new()));
        assert_eq!(detector.extract("hello world"), None);
    }

    #[test]
    fn any_configured_wake_word_matches() {
        let detector =
            KeywordDetector::new(vec!["hey robot".to_string(), "ok robot".to_string()]);
        assert!(detector.extract("ok robot do a dance").is_some());
    }
}
