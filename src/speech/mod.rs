//! Speech task queue
//!
//! A bounded FIFO in front of a single worker thread, which is the only
//! consumer of the audio output device. Each task moves through
//! `queued -> active -> completed | failed`, with every transition published
//! as a `speech` event through the [`StateStore`]. A full queue rejects the
//! caller immediately; nothing here ever blocks a producer.

mod engine;
mod playback;

pub use engine::{EspeakSpeech, OpenAiSpeech, SpeechEngine};
pub use playback::SpeakerOutput;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::state::{STATE_IDLE, STATE_TALKING, StateStore, now_ts};
use crate::{Error, Result};

/// Event type tag for speech lifecycle events
pub const EVENT_SPEECH: &str = "speech";

/// How long the worker sleeps on an empty queue before re-checking shutdown
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounded wait for the worker thread to exit on shutdown
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One queued utterance
#[derive(Debug, Clone)]
pub struct SpeechTask {
    pub id: Uuid,
    pub text: String,
    pub voice: Option<String>,
    pub created_at: f64,
}

/// Wire form of a task in a status report
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub text: String,
    pub voice: String,
    pub status: &'static str,
}

/// Snapshot of the queue: at most one active task plus pending FIFO
#[derive(Debug, Serialize)]
pub struct SpeechStatus {
    pub active: Option<TaskInfo>,
    pub pending: Vec<TaskInfo>,
}

/// What the worker dequeues; `Shutdown` wakes a blocked worker on stop
enum WorkItem {
    Speak(SpeechTask),
    Shutdown,
}

struct Inner {
    pending: VecDeque<WorkItem>,
    active: Option<SpeechTask>,
}

/// Bounded speech queue with a dedicated worker thread
pub struct SpeechQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    capacity: usize,
    default_voice: String,
    store: Arc<StateStore>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SpeechQueue {
    /// Create the queue and spawn its worker thread
    ///
    /// `capacity` bounds the pending FIFO (the active task sits outside it).
    #[must_use]
    pub fn start(
        store: Arc<StateStore>,
        engine: Box<dyn SpeechEngine>,
        capacity: usize,
        default_voice: String,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                active: None,
            }),
            ready: Condvar::new(),
            capacity,
            default_voice,
            store,
            running: AtomicBool::new(true),
            worker: Mutex::new(None),
        });

        let worker_queue = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("speech-worker".to_string())
            .spawn(move || worker_queue.worker_loop(engine.as_ref()))
            .expect("spawn speech worker");
        *queue.worker.lock().unwrap() = Some(handle);
        queue
    }

    /// Queue an utterance
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for blank text and
    /// [`Error::CapacityExceeded`] when the pending FIFO is full. The caller
    /// is never blocked; a full queue is the backpressure signal.
    pub fn enqueue(&self, text: &str, voice: Option<String>) -> Result<SpeechTask> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Validation("cannot speak empty text".to_string()));
        }

        let task = SpeechTask {
            id: Uuid::new_v4(),
            text: text.to_string(),
            voice,
            created_at: now_ts(),
        };

        {
            let mut inner = self.inner.lock().unwrap();
            let queued = inner
                .pending
                .iter()
                .filter(|item| matches!(item, WorkItem::Speak(_)))
                .count();
            if queued >= self.capacity {
                return Err(Error::CapacityExceeded("speech queue is full".to_string()));
            }
            // The queued event must land before the worker can pop the task,
            // or a fast worker would put started ahead of queued in the
            // event history
            self.store.record_event(
                EVENT_SPEECH,
                json!({"id": task.id, "status": "queued", "text": task.text.clone()}),
            );
            inner.pending.push_back(WorkItem::Speak(task.clone()));
        }
        self.ready.notify_one();
        Ok(task)
    }

    /// Report the active task and pending FIFO without mutating either
    #[must_use]
    pub fn status(&self) -> SpeechStatus {
        let inner = self.inner.lock().unwrap();
        SpeechStatus {
            active: inner
                .active
                .as_ref()
                .map(|task| self.task_info(task, "active")),
            pending: inner
                .pending
                .iter()
                .filter_map(|item| match item {
                    WorkItem::Speak(task) => Some(self.task_info(task, "queued")),
                    WorkItem::Shutdown => None,
                })
                .collect(),
        }
    }

    /// Stop the worker: sentinel through the queue, then a bounded join
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.push_back(WorkItem::Shutdown);
        }
        self.ready.notify_all();

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("speech worker did not stop within the join timeout");
            }
        }
    }

    fn task_info(&self, task: &SpeechTask, status: &'static str) -> TaskInfo {
        TaskInfo {
            id: task.id.to_string(),
            text: task.text.clone(),
            voice: task
                .voice
                .clone()
                .unwrap_or_else(|| self.default_voice.clone()),
            status,
        }
    }

    fn worker_loop(&self, engine: &dyn SpeechEngine) {
        while self.running.load(Ordering::Relaxed) {
            // Dequeue in strict FIFO order; marking the task active in the
            // same critical section keeps status() consistent.
            let item = {
                let mut guard = self.inner.lock().unwrap();
                if guard.pending.is_empty() {
                    guard = self
                        .ready
                        .wait_timeout(guard, DEQUEUE_TIMEOUT)
                        .unwrap()
                        .0;
                }
                let item = guard.pending.pop_front();
                if let Some(WorkItem::Speak(task)) = &item {
                    guard.active = Some(task.clone());
                }
                item
            };

            match item {
                None => {}
                Some(WorkItem::Shutdown) => break,
                Some(WorkItem::Speak(task)) => {
                    self.handle_task(engine, &task);
                    self.inner.lock().unwrap().active = None;
                }
            }
        }
        tracing::info!("speech worker stopped");
    }

    fn handle_task(&self, engine: &dyn SpeechEngine, task: &SpeechTask) {
        tracing::info!(id = %task.id, "speaking task");
        self.store.update(state_patch(STATE_TALKING, true));
        self.store.record_event(
            EVENT_SPEECH,
            json!({"id": task.id, "status": "started", "text": task.text.clone()}),
        );

        let voice = task.voice.as_deref().unwrap_or(&self.default_voice);
        match engine.speak(&task.text, voice) {
            Ok(()) => {
                self.store.record_event(
                    EVENT_SPEECH,
                    json!({"id": task.id, "status": "completed", "text": task.text.clone()}),
                );
            }
            Err(e) => {
                tracing::error!(id = %task.id, error = %e, "speech task failed");
                self.store.record_event(
                    EVENT_SPEECH,
                    json!({
                        "id": task.id,
                        "status": "failed",
                        "error": e.to_string(),
                        "text": task.text.clone(),
                    }),
                );
            }
        }

        // Peek, never drain: FIFO order must survive the inspection
        let more_pending = {
            let inner = self.inner.lock().unwrap();
            inner
                .pending
                .iter()
                .any(|item| matches!(item, WorkItem::Speak(_)))
        };
        if more_pending {
            self.store.update(state_patch(STATE_TALKING, false));
        } else {
            self.store.update(state_patch(STATE_IDLE, true));
        }
    }
}

/// Build a `{"state": ..}` merge-patch, optionally stamping `last_talk`
fn state_patch(state: &str, stamp_last_talk: bool) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("state".to_string(), json!(state));
    if stamp_last_talk {
        patch.insert("last_talk".to_string(), json!(now_ts()));
    }
    patch
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

    use super::*;

    /// Engine that records spoken texts and blocks until released
    struct GatedEngine {
        spoken: Arc<Mutex<Vec<String>>>,
        gate: Mutex<Receiver<()>>,
    }

    impl GatedEngine {
        fn new(spoken: Arc<Mutex<Vec<String>>>) -> (Self, SyncSender<()>) {
            let (tx, rx) = sync_channel(16);
            (
                Self {
                    spoken,
                    gate: Mutex::new(rx),
                },
                tx,
            )
        }
    }

    impl SpeechEngine for GatedEngine {
        fn speak(&self, text: &str, _voice: &str) -> Result<()> {
            self.gate
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| Error::Tts("gate closed".to_string()))?;
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Engine that completes immediately
    struct InstantEngine;

    impl SpeechEngine for InstantEngine {
        fn speak(&self, _text: &str, _voice: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_store() -> (tempfile::TempDir, Arc<StateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json"), 64));
        (dir, store)
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn blank_text_is_rejected_before_queueing() {
        let (_dir, store) = test_store();
        let queue = SpeechQueue::start(store, Box::new(InstantEngine), 4, "alloy".to_string());
        assert!(matches!(queue.enqueue("   ", None), Err(Error::Validation(_))));
        assert!(queue.status().pending.is_empty());
        queue.shutdown();
    }

    #[test]
    fn full_queue_returns_capacity_error_without_blocking() {
        let (_dir, store) = test_store();
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let (engine, release) = GatedEngine::new(Arc::clone(&spoken));
        let queue = SpeechQueue::start(store, Box::new(engine), 1, "alloy".to_string());

        queue.enqueue("a", None).unwrap();
        // Wait for the worker to pull "a" off the FIFO and go active
        assert!(wait_until(Duration::from_secs(2), || {
            queue.status().active.is_some()
        }));

        queue.enqueue("b", None).unwrap();
        let err = queue.enqueue("c", None);
        assert!(matches!(err, Err(Error::CapacityExceeded(_))));

        release.send(()).unwrap();
        release.send(()).unwrap();
        queue.shutdown();
    }

    #[test]
    fn tasks_run_in_submission_order_and_state_returns_to_idle() {
        let (_dir, store) = test_store();
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let (engine, release) = GatedEngine::new(Arc::clone(&spoken));
        let queue = SpeechQueue::start(
            Arc::clone(&store),
            Box::new(engine),
            4,
            "alloy".to_string(),
        );

        queue.enqueue("a", None).unwrap();
        queue.enqueue("b", None).unwrap();
        queue.enqueue("c", None).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            queue
                .status()
                .active
                .as_ref()
                .is_some_and(|t| t.text == "a")
        }));
        let pending: Vec<String> = queue.status().pending.iter().map(|t| t.text.clone()).collect();
        assert_eq!(pending, vec!["b", "c"]);

        for _ in 0..3 {
            release.send(()).unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || {
            let status = queue.status();
            status.active.is_none() && status.pending.is_empty()
        }));

        assert_eq!(*spoken.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(wait_until(Duration::from_secs(2), || {
            store.snapshot()["state"] == serde_json::json!("idle")
        }));
        queue.shutdown();
    }

    #[test]
    fn lifecycle_events_flow_through_the_store() {
        let (_dir, store) = test_store();
        let (_, listener) = store.subscribe(32);
        let queue = SpeechQueue::start(
            Arc::clone(&store),
            Box::new(InstantEngine),
            4,
            "alloy".to_string(),
        );
        queue.enqueue("hello", None).unwrap();

        let mut statuses = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && !statuses.contains(&"completed".to_string()) {
            if let Ok(event) = listener.recv_timeout(Duration::from_millis(200)) {
                if event.kind == EVENT_SPEECH {
                    if let Some(status) = event.data["status"].as_str() {
                        statuses.push(status.to_string());
                    }
                }
            }
        }
        assert_eq!(statuses, vec!["queued", "started", "completed"]);
        queue.shutdown();
    }

    #[test]
    fn queued_precedes_started_for_every_task() {
        let (_dir, store) = test_store();
        let queue = SpeechQueue::start(
            Arc::clone(&store),
            Box::new(InstantEngine),
            16,
            "alloy".to_string(),
        );

        // An instant engine lets the worker race each enqueue; the per-task
        // event order must hold anyway
        let mut ids = Vec::new();
        for i in 0..10 {
            let task = queue.enqueue(&format!("utterance {i}"), None).unwrap();
            ids.push(task.id.to_string());
        }
        assert!(wait_until(Duration::from_secs(2), || {
            store
                .history()
                .iter()
                .filter(|e| e.kind == EVENT_SPEECH && e.data["status"] == "completed")
                .count()
                == 10
        }));

        let history = store.history();
        for id in &ids {
            let statuses: Vec<&str> = history
                .iter()
                .filter(|e| e.kind == EVENT_SPEECH && e.data["id"] == json!(id))
                .filter_map(|e| e.data["status"].as_str())
                .collect();
            assert_eq!(statuses, vec!["queued", "started", "completed"], "task {id}");
        }
        queue.shutdown();
    }

    #[test]
    fn shutdown_wakes_an_idle_worker_promptly() {
        let (_dir, store) = test_store();
        let queue = SpeechQueue::start(store, Box::new(InstantEngine), 4, "alloy".to_string());
        let started = Instant::now();
        queue.shutdown();
        assert!(started.elapsed() < JOIN_TIMEOUT);
    }

    #[test]
    fn default_voice_fills_in_for_unspecified_tasks() {
        let (_dir, store) = test_store();
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let (engine, _release) = GatedEngine::new(spoken);
        let queue = SpeechQueue::start(store, Box::new(engine), 4, "ember".to_string());
        queue.enqueue("a", None).unwrap();
        queue.enqueue("b", Some("sage".to_string())).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            queue.status().active.is_some()
        }));
        let status = queue.status();
        assert_eq!(status.active.unwrap().voice, "ember");
        assert_eq!(status.pending[0].voice, "sage");
        queue.shutdown();
    }
}
