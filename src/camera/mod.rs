//! Camera feeds and frame fan-out
//!
//! Each configured camera gets a [`CameraFeed`]: a capture thread that pulls
//! JPEG frames from a [`FrameSource`] into a single last-frame slot. Readers
//! only ever see the most recent frame, so a slow consumer can never make a
//! fast camera buffer frames. The [`FrameBroadcaster`] owns every feed and is
//! the lookup surface the HTTP layer talks to.

mod source;

pub use source::{FfmpegSource, FrameSource};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::{Error, Result};

/// Bounded wait for a capture thread to exit on stop
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between grabs when the source has nothing for us
const IDLE_RETRY: Duration = Duration::from_millis(100);

/// One configured camera
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub name: String,
    pub device: String,
    pub width: u32,
    pub height: u32,
}

/// Wire form of a camera in a listing
#[derive(Debug, Serialize)]
pub struct CameraInfo {
    pub name: String,
    pub device: String,
    pub active: bool,
}

type SourceFactory = Arc<dyn Fn() -> Box<dyn FrameSource> + Send + Sync>;

/// One camera's capture thread plus its last-frame slot
pub struct CameraFeed {
    config: CameraConfig,
    factory: SourceFactory,
    slot: Arc<Mutex<Option<Vec<u8>>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CameraFeed {
    fn new(config: CameraConfig, factory: SourceFactory) -> Self {
        Self {
            config,
            factory,
            slot: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Start the capture thread; a no-op when already running
    fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut source = (self.factory)();
        let slot = Arc::clone(&self.slot);
        let running = Arc::clone(&self.running);
        let name = self.config.name.clone();

        let handle = std::thread::Builder::new()
            .name(format!("camera-{name}"))
            .spawn(move || {
                tracing::info!(camera = %name, "capture started");
                while running.load(Ordering::SeqCst) {
                    match source.grab() {
                        Ok(Some(frame)) => {
                            *slot.lock().unwrap() = Some(frame);
                        }
                        Ok(None) => std::thread::sleep(IDLE_RETRY),
                        Err(e) => {
                            tracing::warn!(camera = %name, error = %e, "frame grab failed");
                            std::thread::sleep(IDLE_RETRY);
                        }
                    }
                }
                source.close();
                tracing::info!(camera = %name, "capture stopped");
            })
            .expect("spawn camera capture thread");
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Stop the capture thread and clear the cached frame
    fn stop(&self) {
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
                tracing::warn!(camera = %self.config.name, "capture thread did not stop in time");
            }
        }
        // A stale frame from a stopped camera must not be served later
        *self.slot.lock().unwrap() = None;
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Most recent frame, if any has been captured since (re)start
    fn frame(&self) -> Option<Vec<u8>> {
        self.slot.lock().unwrap().clone()
    }
}

/// Owns every camera feed; the lookup surface for streaming and control
pub struct FrameBroadcaster {
    feeds: HashMap<String, CameraFeed>,
}

impl FrameBroadcaster {
    /// Build feeds for every configured camera, using ffmpeg for capture
    #[must_use]
    pub fn new(cameras: Vec<CameraConfig>) -> Self {
        Self::with_factory(cameras, |config| {
            let (device, width, height) = (config.device.clone(), config.width, config.height);
            Arc::new(move || {
                Box::new(FfmpegSource::new(device.clone(), width, height)) as Box<dyn FrameSource>
            })
        })
    }

    /// Build feeds with a caller-supplied source factory per camera
    pub fn with_factory(
        cameras: Vec<CameraConfig>,
        make_factory: impl Fn(&CameraConfig) -> SourceFactory,
    ) -> Self {
        let feeds = cameras
            .into_iter()
            .map(|config| {
                let factory = make_factory(&config);
                (config.name.clone(), CameraFeed::new(config, factory))
            })
            .collect();
        Self { feeds }
    }

    /// List every configured camera and whether its feed is running
    #[must_use]
    pub fn list(&self) -> Vec<CameraInfo> {
        let mut cameras: Vec<CameraInfo> = self
            .feeds
            .values()
            .map(|feed| CameraInfo {
                name: feed.config.name.clone(),
                device: feed.config.device.clone(),
                active: feed.is_active(),
            })
            .collect();
        cameras.sort_by(|a, b| a.name.cmp(&b.name));
        cameras
    }

    /// Start the named feed, idempotently
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownResource`] when no such camera is configured.
    pub fn ensure_started(&self, name: &str) -> Result<()> {
        self.feed(name)?.start();
        Ok(())
    }

    /// Stop the named feed, idempotently
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownResource`] when no such camera is configured.
    pub fn stop(&self, name: &str) -> Result<()> {
        self.feed(name)?.stop();
        Ok(())
    }

    /// Latest frame from the named feed, `None` until one has been captured
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownResource`] when no such camera is configured.
    pub fn frame(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.feed(name)?.frame())
    }

    /// Whether the named feed exists and is running
    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.feeds.get(name).is_some_and(CameraFeed::is_active)
    }

    /// Stop every running feed; part of daemon shutdown
    pub fn stop_all(&self) {
        for feed in self.feeds.values() {
            feed.stop();
        }
    }

    fn feed(&self, name: &str) -> Result<&CameraFeed> {
        self.feeds
            .get(name)
            .ok_or_else(|| Error::UnknownResource(format!("no camera named {name}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

    use super::*;

    /// Source that replays a script of frames handed to it over a channel
    struct ScriptedSource {
        frames: Receiver<Vec<u8>>,
        closed: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        fn grab(&mut self) -> Result<Option<Vec<u8>>> {
            match self.frames.recv_timeout(Duration::from_millis(50)) {
                Ok(frame) => Ok(Some(frame)),
                Err(_) => Ok(None),
            }
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn scripted_broadcaster() -> (FrameBroadcaster, SyncSender<Vec<u8>>, Arc<AtomicBool>) {
        let (tx, rx) = sync_channel(16);
        let rx = Arc::new(Mutex::new(Some(rx)));
        let closed = Arc::new(AtomicBool::new(false));
        let closed_handle = Arc::clone(&closed);
        let config = CameraConfig {
            name: "head".to_string(),
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
        };
        let broadcaster = FrameBroadcaster::with_factory(vec![config], move |_| {
            let rx = Arc::clone(&rx);
            let closed = Arc::clone(&closed_handle);
            Arc::new(move || {
                let frames = rx.lock().unwrap().take().expect("single start per test");
                Box::new(ScriptedSource {
                    frames,
                    closed: Arc::clone(&closed),
                }) as Box<dyn FrameSource>
            })
        });
        (broadcaster, tx, closed)
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
    fn unknown_camera_is_reported_as_such() {
        let (broadcaster, _tx, _closed) = scripted_broadcaster();
        assert!(matches!(
            broadcaster.ensure_started("tail"),
            Err(Error::UnknownResource(_))
        ));
        assert!(matches!(broadcaster.frame("tail"), Err(Error::UnknownResource(_))));
        assert!(matches!(broadcaster.stop("tail"), Err(Error::UnknownResource(_))));
    }

    #[test]
    fn readers_see_only_the_most_recent_frame() {
        let (broadcaster, tx, _closed) = scripted_broadcaster();
        broadcaster.ensure_started("head").unwrap();

        tx.send(vec![1]).unwrap();
        tx.send(vec![2]).unwrap();
        tx.send(vec![3]).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            broadcaster.frame("head").unwrap() == Some(vec![3])
        }));
        broadcaster.stop_all();
    }

    #[test]
    fn frame_is_none_before_any_capture() {
        let (broadcaster, _tx, _closed) = scripted_broadcaster();
        broadcaster.ensure_started("head").unwrap();
        assert_eq!(broadcaster.frame("head").unwrap(), None);
        broadcaster.stop_all();
    }

    #[test]
    fn stop_clears_the_cached_frame_and_closes_the_source() {
        let (broadcaster, tx, closed) = scripted_broadcaster();
        broadcaster.ensure_started("head").unwrap();
        tx.send(vec![9]).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            broadcaster.frame("head").unwrap().is_some()
        }));

        broadcaster.stop("head").unwrap();
        assert_eq!(broadcaster.frame("head").unwrap(), None);
        assert!(closed.load(Ordering::SeqCst));
        assert!(!broadcaster.is_active("head"));
    }

    #[test]
    fn start_is_idempotent() {
        let (broadcaster, tx, _closed) = scripted_broadcaster();
        broadcaster.ensure_started("head").unwrap();
        // Second start must not try to build a second source
        broadcaster.ensure_started("head").unwrap();
        assert!(broadcaster.is_active("head"));
        tx.send(vec![7]).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            broadcaster.frame("head").unwrap() == Some(vec![7])
        }));
        broadcaster.stop_all();
    }

    #[test]
    fn listing_reports_activity_per_camera() {
        let (broadcaster, _tx, _closed) = scripted_broadcaster();
        let listed = broadcaster.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "head");
        assert!(!listed[0].active);

        broadcaster.ensure_started("head").unwrap();
        assert!(broadcaster.list()[0].active);
        broadcaster.stop_all();
    }
}
