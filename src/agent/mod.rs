//! Conversational agent and pipeline coordination
//!
//! [`ChatClient`] turns a user utterance into a spoken reply plus optional
//! robot actions, preferring a local Ollama model and falling back to
//! deterministic rules when no model is reachable. The [`Coordinator`] is
//! the only place the voice, chat, and speech subsystems meet: it drains
//! confirmed voice commands from a channel and drives the other two, so a
//! failure in any stage never takes down its neighbors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, json};

use crate::speech::SpeechQueue;
use crate::state::{StateStore, now_ts};
use crate::voice::VoiceCommand;
use crate::{Error, Result};

/// Conversation turns kept for context and the history endpoint
const HISTORY_LIMIT: usize = 20;

/// Bounded wait for the coordinator thread on shutdown
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What the robot says when the wake word arrives with no command
const PROMPT_REPLY: &str = "Yes?";

const SYSTEM_PROMPT: &str = "You are the voice of a small home robot. \
Reply with a JSON object: {\"reply\": \"<what to say aloud>\", \
\"actions\": [{\"type\": \"set_state\", \"state\": \"...\"} | \
{\"type\": \"toggle\", \"name\": \"...\", \"value\": true|false}]}. \
Keep replies to one or two short sentences.";

/// One turn of the conversation
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub ts: f64,
}

/// A robot action requested by the model or a fallback rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    SetState { state: String },
    Toggle { name: String, value: bool },
}

#[derive(Debug, Deserialize)]
struct AgentReply {
    reply: String,
    #[serde(default)]
    actions: Vec<Action>,
}

/// Ollama endpoint settings
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

struct OllamaBackend {
    client: reqwest::blocking::Client,
    config: OllamaConfig,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

/// Chat with action side effects against the state store
pub struct ChatClient {
    backend: Option<OllamaBackend>,
    store: Arc<StateStore>,
    history: Mutex<VecDeque<ChatMessage>>,
}

impl ChatClient {
    #[must_use]
    pub fn new(store: Arc<StateStore>, ollama: Option<OllamaConfig>) -> Self {
        Self {
            backend: ollama.map(|config| OllamaBackend {
                client: reqwest::blocking::Client::new(),
                config,
            }),
            store,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// A client with no model backend; every reply comes from the rules
    #[must_use]
    pub fn fallback_only(store: Arc<StateStore>) -> Self {
        Self::new(store, None)
    }

    /// Produce a reply for `text`, applying any requested actions
    ///
    /// The model is tried first when configured; a model failure degrades to
    /// the rule fallback rather than surfacing an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for blank input.
    pub fn chat(&self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Validation("cannot chat with empty text".to_string()));
        }

        let AgentReply { reply, actions } = match self.ask_model(text) {
            Some(Ok(parsed)) => parsed,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "model backend failed, using rule fallback");
                self.rule_reply(text)
            }
            None => self.rule_reply(text),
        };

        for action in &actions {
            self.apply_action(action);
        }
        self.push_turn("user", text);
        self.push_turn("assistant", &reply);
        Ok(reply)
    }

    /// The retained conversation, oldest turn first
    #[must_use]
    pub fn conversation(&self) -> Vec<ChatMessage> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    fn ask_model(&self, text: &str) -> Option<Result<AgentReply>> {
        let backend = self.backend.as_ref()?;
        Some(self.ask_ollama(backend, text))
    }

    fn ask_ollama(&self, backend: &OllamaBackend, text: &str) -> Result<AgentReply> {
        let mut messages = vec![OllamaMessage {
            role: "system",
            content: SYSTEM_PROMPT,
        }];
        let history = self.history.lock().unwrap().clone();
        for turn in &history {
            messages.push(OllamaMessage {
                role: &turn.role,
                content: &turn.content,
            });
        }
        messages.push(OllamaMessage {
            role: "user",
            content: text,
        });

        let url = format!("{}/api/chat", backend.config.base_url);
        let response = backend
            .client
            .post(&url)
            .json(&json!({
                "model": backend.config.model,
                "messages": messages,
                "stream": false,
                "format": "json",
            }))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::Chat(format!("Ollama error {status}: {body}")));
        }

        let body: OllamaResponse = response.json()?;
        let parsed: AgentReply = serde_json::from_str(&body.message.content)
            .map_err(|e| Error::Chat(format!("model reply was not valid JSON: {e}")))?;
        Ok(parsed)
    }

    /// Deterministic fallback for when no model is reachable
    fn rule_reply(&self, text: &str) -> AgentReply {
        let lowered = text.to_lowercase();

        if let Some(name) = lowered.strip_prefix("turn on ") {
            let name = name.trim().to_string();
            return AgentReply {
                reply: format!("Turning on {name}."),
                actions: vec![Action::Toggle { name, value: true }],
            };
        }
        if let Some(name) = lowered.strip_prefix("turn off ") {
            let name = name.trim().to_string();
            return AgentReply {
                reply: format!("Turning off {name}."),
                actions: vec![Action::Toggle { name, value: false }],
            };
        }
        if lowered.contains("go to sleep") || lowered == "sleep" {
            return AgentReply {
                reply: "Going to sleep. Say the wake word when you need me.".to_string(),
                actions: vec![Action::SetState {
                    state: "sleeping".to_string(),
                }],
            };
        }
        if lowered.contains("wake up") {
            return AgentReply {
                reply: "I'm awake.".to_string(),
                actions: vec![Action::SetState {
                    state: "idle".to_string(),
                }],
            };
        }
        if lowered.contains("hello") || lowered.contains("hi ") || lowered == "hi" {
            return AgentReply {
                reply: "Hello! How can I help?".to_string(),
                actions: Vec::new(),
            };
        }
        if lowered.contains("status") || lowered.contains("how are you") {
            let state = self.store.snapshot()["state"]
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            return AgentReply {
                reply: format!("I'm {state} right now."),
                actions: Vec::new(),
            };
        }

        AgentReply {
            reply: "I'm not sure how to help with that.".to_string(),
            actions: Vec::new(),
        }
    }

    fn apply_action(&self, action: &Action) {
        tracing::info!(?action, "applying agent action");
        let mut patch = Map::new();
        match action {
            Action::SetState { state } => {
                patch.insert("state".to_string(), json!(state));
            }
            Action::Toggle { name, value } => {
                patch.insert("toggles".to_string(), json!({ name.clone(): value }));
            }
        }
        self.store.update(patch);
    }

    fn push_turn(&self, role: &str, content: &str) {
        let mut history = self.history.lock().unwrap();
        history.push_back(ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
            ts: now_ts(),
        });
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }
}

/// Drives voice commands through chat and into the speech queue
pub struct Coordinator {
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Spawn the coordinator thread over a voice command channel
    #[must_use]
    pub fn start(
        commands: Receiver<VoiceCommand>,
        chat: Arc<ChatClient>,
        speech: Arc<SpeechQueue>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let loop_running = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("coordinator".to_string())
            .spawn(move || {
                while loop_running.load(Ordering::Relaxed) {
                    match commands.recv_timeout(Duration::from_millis(500)) {
                        Ok(command) => handle_command(&chat, &speech, &command),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("coordinator stopped");
            })
            .expect("spawn coordinator thread");

        Self {
            running,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Stop the coordinator with a bounded join
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("coordinator thread did not stop in time");
            }
        }
    }
}

fn handle_command(chat: &ChatClient, speech: &SpeechQueue, command: &VoiceCommand) {
    tracing::info!(transcript = %command.transcript, "voice command received");

    let reply = if command.command.is_empty() {
        PROMPT_REPLY.to_string()
    } else {
        match chat.chat(&command.command) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "chat failed for voice command");
                return;
            }
        }
    };

    // A saturated speech queue drops the reply; the conversation history
    // still records it
    if let Err(e) = speech.enqueue(&reply, None) {
        tracing::warn!(error = %e, "could not queue spoken reply");
    }
}
