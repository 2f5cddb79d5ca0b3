//! Streaming endpoints: server-sent events and MJPEG
//!
//! Both endpoints bridge a thread-side producer into an axum response body:
//! a blocking task drains the source and pushes chunks over a tokio channel
//! that backs the response stream. Client disconnects surface as a closed
//! channel, which tears the blocking side down.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::header,
    response::Response,
};
use tokio_stream::wrappers::ReceiverStream;

use super::ApiState;
use super::robot::ApiError;
use crate::state::Event;

/// Per-client SSE queue bound; a client this far behind is dropped
const SSE_QUEUE_CAPACITY: usize = 64;

/// How often the event forwarder checks for a gone client
const SSE_POLL: Duration = Duration::from_millis(500);

/// Cadence for resending the cached frame to an MJPEG client
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Cadence for re-checking a camera that has no frame yet
const EMPTY_RETRY: Duration = Duration::from_millis(50);

/// MJPEG multipart boundary
const BOUNDARY: &str = "frame";

type Chunk = std::result::Result<Bytes, Infallible>;

/// `GET /stream/events`
///
/// Replays the full event history, then follows live events. History and
/// registration happen atomically in the store, so no event between the two
/// is missed or duplicated.
pub async fn events(State(state): State<Arc<ApiState>>) -> Response {
    let (history, listener) = state.store.subscribe(SSE_QUEUE_CAPACITY);
    let listener_id = listener.id();
    let store = Arc::clone(&state.store);

    let (tx, rx) = tokio::sync::mpsc::channel::<Chunk>(SSE_QUEUE_CAPACITY);

    tokio::task::spawn_blocking(move || {
        for event in &history {
            if send_event(&tx, event).is_err() {
                store.remove_listener(listener_id);
                return;
            }
        }

        loop {
            if tx.is_closed() {
                break;
            }
            match listener.recv_timeout(SSE_POLL) {
                Ok(event) => {
                    if send_event(&tx, &event).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                // Disconnected means the store dropped us for falling behind
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        store.remove_listener(listener_id);
        tracing::debug!(listener_id, "event stream closed");
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn send_event(tx: &tokio::sync::mpsc::Sender<Chunk>, event: &Event) -> std::result::Result<(), ()> {
    let Ok(json) = serde_json::to_string(event) else {
        tracing::warn!("unserializable event skipped");
        return Ok(());
    };
    let frame = format!("data: {json}\n\n");
    tx.blocking_send(Ok(Bytes::from(frame))).map_err(|_| ())
}

/// `GET /stream/camera/{name}`
///
/// Starts the feed if needed and serves the cached frame as an MJPEG
/// multipart stream. Every client gets the most recent frame at its own
/// pace; nobody can hold frames back for anyone else.
pub async fn camera(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.cameras.ensure_started(&name)?;
    let cameras = Arc::clone(&state.cameras);

    let (tx, rx) = tokio::sync::mpsc::channel::<Chunk>(4);

    tokio::task::spawn_blocking(move || {
        loop {
            if tx.is_closed() {
                break;
            }
            match cameras.frame(&name) {
                Ok(Some(frame)) => {
                    if tx.blocking_send(Ok(mjpeg_part(&frame))).is_err() {
                        break;
                    }
                    std::thread::sleep(FRAME_INTERVAL);
                }
                Ok(None) => std::thread::sleep(EMPTY_RETRY),
                Err(_) => break,
            }
        }
        tracing::debug!(camera = %name, "camera stream closed");
    });

    Ok(Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| Response::new(Body::empty())))
}

/// One multipart part: boundary, JPEG headers, frame bytes
fn mjpeg_part(frame: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(frame.len() + 128);
    part.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            frame.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}
