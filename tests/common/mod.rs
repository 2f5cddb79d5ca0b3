//! Shared test fixtures

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hearth_controller::Result;
use hearth_controller::agent::ChatClient;
use hearth_controller::api::{ApiServer, ApiState};
use hearth_controller::camera::{CameraConfig, FrameBroadcaster, FrameSource};
use hearth_controller::metrics::MetricsService;
use hearth_controller::speech::{SpeechEngine, SpeechQueue};
use hearth_controller::state::StateStore;

/// Engine that records every spoken text and completes immediately
pub struct RecordingEngine {
    pub spoken: Arc<Mutex<Vec<String>>>,
}

impl RecordingEngine {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let spoken = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                spoken: Arc::clone(&spoken),
            },
            spoken,
        )
    }
}

impl SpeechEngine for RecordingEngine {
    fn speak(&self, text: &str, _voice: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Source serving one fixed frame forever
struct StaticSource {
    frame: Vec<u8>,
}

impl FrameSource for StaticSource {
    fn grab(&mut self) -> Result<Option<Vec<u8>>> {
        std::thread::sleep(Duration::from_millis(5));
        Ok(Some(self.frame.clone()))
    }
}

/// A broadcaster with one "head" camera backed by a fixed frame
pub fn static_broadcaster(frame: Vec<u8>) -> FrameBroadcaster {
    let config = CameraConfig {
        name: "head".to_string(),
        device: "/dev/video0".to_string(),
        width: 640,
        height: 480,
    };
    FrameBroadcaster::with_factory(vec![config], move |_| {
        let frame = frame.clone();
        Arc::new(move || {
            Box::new(StaticSource {
                frame: frame.clone(),
            }) as Box<dyn FrameSource>
        })
    })
}

pub struct TestApp {
    pub router: axum::Router,
    pub store: Arc<StateStore>,
    pub speech: Arc<SpeechQueue>,
    pub spoken: Arc<Mutex<Vec<String>>>,
    _dir: tempfile::TempDir,
}

/// Full API app over fake hardware
///
/// `speech_capacity` bounds the pending FIFO and `api_key` gates the
/// mutating routes.
pub fn test_app(speech_capacity: usize, api_key: Option<String>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json"), 64));

    let (engine, spoken) = RecordingEngine::new();
    let speech = SpeechQueue::start(
        Arc::clone(&store),
        Box::new(engine),
        speech_capacity,
        "alloy".to_string(),
    );

    let state = ApiState {
        store: Arc::clone(&store),
        speech: Arc::clone(&speech),
        cameras: Arc::new(static_broadcaster(vec![0xFF, 0xD8, 0xFF, 0xD9])),
        voice: None,
        chat: Arc::new(ChatClient::fallback_only(Arc::clone(&store))),
        metrics: Arc::new(MetricsService::new()),
        api_key,
    };

    TestApp {
        router: ApiServer::new(state, 0).into_router(),
        store,
        speech,
        spoken,
        _dir: dir,
    }
}

/// Poll `check` until it holds or the deadline passes
pub fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
