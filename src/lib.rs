//! Hearth - home robot controller
//!
//! A small controller daemon for a home robot: persisted merge-patch state,
//! an event bus with bounded history, a single-worker speech queue, camera
//! frame fan-out, and wake-word voice input, behind a thin HTTP API.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   HTTP API (axum)                │
//! │   REST  │  SSE events  │  MJPEG camera streams   │
//! └──────────────────────┬───────────────────────────┘
//!                        │
//! ┌──────────────────────▼───────────────────────────┐
//! │                 StateStore + events              │
//! │   merge-patch state  │  history ring  │ fan-out  │
//! └──────┬───────────────┬──────────────┬────────────┘
//!        │               │              │
//!   speech queue    camera feeds    voice input
//!   (one worker)    (last frame)    (wake word)
//! ```
//!
//! The core runs on plain OS threads; tokio exists only at the HTTP edge.

pub mod agent;
pub mod api;
pub mod camera;
pub mod config;
pub mod daemon;
pub mod error;
pub mod metrics;
pub mod speech;
pub mod state;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use state::{Event, EventListener, StateStore};
