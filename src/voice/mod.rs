//! Voice input
//!
//! A polling thread drains the microphone, slices utterances with the
//! [`EnergyGate`], transcribes them, and confirms the wake word. Confirmed
//! commands go out over a channel to the coordinator; the HTTP layer only
//! starts and stops the listener.

mod capture;
mod stt;
mod wake;

pub use capture::{MicCapture, SAMPLE_RATE, samples_to_wav};
pub use stt::{Transcriber, WhisperTranscriber};
pub use wake::{EnergyGate, KeywordDetector, WakeWordDetector};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::HostTrait;
use serde_json::json;

use crate::Result;
use crate::state::{StateStore, now_ts};

/// Event type tag for voice activity events
pub const EVENT_VOICE: &str = "voice";

/// Microphone drain cadence
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded wait for the listener thread on stop
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A wake-word-confirmed utterance
#[derive(Debug, Clone)]
pub struct VoiceCommand {
    /// Full transcript including the wake word
    pub transcript: String,
    /// The part after the wake word; may be empty
    pub command: String,
    pub ts: f64,
}

/// Owns the listener thread and its start/stop lifecycle
pub struct VoiceInput {
    store: Arc<StateStore>,
    transcriber: Arc<dyn Transcriber>,
    detector: Arc<dyn WakeWordDetector>,
    commands: Sender<VoiceCommand>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceInput {
    #[must_use]
    pub fn new(
        store: Arc<StateStore>,
        transcriber: Arc<dyn Transcriber>,
        detector: Arc<dyn WakeWordDetector>,
        commands: Sender<VoiceCommand>,
    ) -> Self {
        Self {
            store,
            transcriber,
            detector,
            commands,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Start listening; a no-op when already running
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Audio`] when no input device exists. The
    /// listener is not considered started in that case.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // The capture stream is tied to the listener thread, so only the
        // device check happens here
        if cpal::default_host().default_input_device().is_none() {
            self.running.store(false, Ordering::SeqCst);
            return Err(crate::Error::Audio(
                "no input device available".to_string(),
            ));
        }

        let store = Arc::clone(&self.store);
        let transcriber = Arc::clone(&self.transcriber);
        let detector = Arc::clone(&self.detector);
        let commands = self.commands.clone();
        let running = Arc::clone(&self.running);

        let handle = std::thread::Builder::new()
            .name("voice-input".to_string())
            .spawn(move || {
                let mut mic = match MicCapture::new().and_then(|mut mic| {
                    mic.start()?;
                    Ok(mic)
                }) {
                    Ok(mic) => mic,
                    Err(e) => {
                        tracing::error!(error = %e, "microphone start failed");
                        store.record_event(
                            EVENT_VOICE,
                            json!({"status": "error", "message": e.to_string()}),
                        );
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                store.record_event(EVENT_VOICE, json!({"status": "listening"}));

                let mut gate = EnergyGate::new();
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(POLL_INTERVAL);
                    let samples = mic.drain();
                    if samples.is_empty() {
                        continue;
                    }
                    let Some(segment) = gate.push(&samples) else {
                        continue;
                    };

                    match transcribe_segment(&*transcriber, &segment) {
                        Ok(transcript) => {
                            if let Some(command) = detector.extract(&transcript) {
                                store.record_event(
                                    EVENT_VOICE,
                                    json!({
                                        "status": "command",
                                        "transcript": transcript.clone(),
                                        "command": command.clone(),
                                    }),
                                );
                                let sent = commands.send(VoiceCommand {
                                    transcript,
                                    command,
                                    ts: now_ts(),
                                });
                                if sent.is_err() {
                                    tracing::warn!("coordinator channel closed");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "transcription failed");
                        }
                    }
                }

                mic.stop();
                store.record_event(EVENT_VOICE, json!({"status": "stopped"}));
            })
            .expect("spawn voice input thread");

        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop listening; a no-op when not running
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("voice input thread did not stop in time");
            }
        }
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn transcribe_segment(transcriber: &dyn Transcriber, segment: &[f32]) -> Result<String> {
    let wav = samples_to_wav(segment, SAMPLE_RATE)?;
    transcriber.transcribe(&wav)
}
