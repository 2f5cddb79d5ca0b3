//! Canonical robot state and event fan-out
//!
//! One [`StateStore`] owns the mutable robot state, the bounded event history
//! ring, and the listener registry, all guarded by a single mutex. Producers
//! mutate state with JSON merge-patches; consumers either read snapshots or
//! subscribe for a history-plus-live event feed.
//!
//! Fan-out never blocks a producer: broadcasts copy the listener set under
//! the lock and then `try_send` outside it. A listener whose queue is full is
//! dropped and deregistered rather than stalling anyone else.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{Error, Result};

/// Top-level key holding the robot's coarse activity tag
pub const STATE_KEY: &str = "state";

/// Value of [`STATE_KEY`] while speech is playing
pub const STATE_TALKING: &str = "talking";

/// Value of [`STATE_KEY`] when nothing is happening
pub const STATE_IDLE: &str = "idle";

/// Sub-mapping merged key-wise instead of being replaced
const TOGGLES_KEY: &str = "toggles";

/// Timestamp of the most recent speech activity
const LAST_TALK_KEY: &str = "last_talk";

/// Event type tag for full-state change events
pub const EVENT_STATE: &str = "state";

/// Current time as float seconds since the Unix epoch
#[allow(clippy::cast_precision_loss)]
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// An immutable fact distributed to every subscriber
///
/// Serializes as the wire triple `{"type": ..., "data": ..., "ts": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type tag (e.g. `"state"`, `"speech"`, `"voice"`)
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary payload
    pub data: Value,
    /// Capture time, float seconds since the Unix epoch
    pub ts: f64,
}

impl Event {
    fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            ts: now_ts(),
        }
    }
}

/// Consumer half of a subscription
///
/// Dropped (or deregistered after overflow) listeners see the channel
/// disconnect on their next receive.
pub struct EventListener {
    id: u64,
    rx: Receiver<Event>,
}

impl EventListener {
    /// Identity token used for [`StateStore::remove_listener`]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Block for the next event, up to `timeout`
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when no event arrived in time and `Disconnected`
    /// once the listener has been deregistered.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Event, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Non-blocking receive
    ///
    /// # Errors
    ///
    /// Returns `Empty` when no event is queued and `Disconnected` once the
    /// listener has been deregistered.
    pub fn try_recv(&self) -> std::result::Result<Event, TryRecvError> {
        self.rx.try_recv()
    }
}

/// Producer half of a registered listener, kept in the registry
struct ListenerSlot {
    id: u64,
    tx: SyncSender<Event>,
}

/// Everything guarded by the store's single mutex
struct Shared {
    state: Map<String, Value>,
    history: VecDeque<Event>,
    listeners: Vec<ListenerSlot>,
    next_listener_id: u64,
}

/// Shared state store with persistence and event fan-out
pub struct StateStore {
    shared: Mutex<Shared>,
    path: PathBuf,
    history_capacity: usize,
}

impl StateStore {
    /// Open the store, loading persisted state from `path` if present
    ///
    /// A missing or unparseable state file falls back to the default state;
    /// a fresh file is written on the first mutation.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, history_capacity: usize) -> Self {
        let path = path.into();
        let state = load_state(&path).unwrap_or_else(default_state);
        Self {
            shared: Mutex::new(Shared {
                state,
                history: VecDeque::with_capacity(history_capacity),
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
            path,
            history_capacity,
        }
    }

    /// Independent deep copy of the current state
    ///
    /// Callers never observe a mutation in progress.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let shared = self.shared.lock().unwrap();
        Value::Object(shared.state.clone())
    }

    /// Merge `patch` into the state, persist, and broadcast the new snapshot
    ///
    /// Top-level keys overwrite, except `toggles` which merges key-by-key
    /// into the existing toggle map. Entering the `"talking"` state stamps
    /// `last_talk` when the merged result carries none. The full state is
    /// written to disk (atomic replace) before this returns; a write failure
    /// is logged and does not roll back the in-memory mutation.
    pub fn update(&self, patch: Map<String, Value>) -> Value {
        let (event, targets, snapshot) = {
            let mut shared = self.shared.lock().unwrap();
            merge_patch(&mut shared.state, patch);

            let talking =
                shared.state.get(STATE_KEY).and_then(Value::as_str) == Some(STATE_TALKING);
            if talking && !shared.state.contains_key(LAST_TALK_KEY) {
                shared.state.insert(LAST_TALK_KEY.to_string(), json!(now_ts()));
            }

            let snapshot = Value::Object(shared.state.clone());
            if let Err(e) = persist(&self.path, &snapshot) {
                tracing::error!(path = %self.path.display(), error = %e, "state persist failed");
            }

            let event = Event::new(EVENT_STATE, snapshot.clone());
            let targets = Self::stage(&mut shared, self.history_capacity, event.clone());
            (event, targets, snapshot)
        };
        self.deliver(&event, targets);
        snapshot
    }

    /// Append and broadcast a lifecycle event without touching robot state
    pub fn record_event(&self, kind: &str, data: Value) {
        let (event, targets) = {
            let mut shared = self.shared.lock().unwrap();
            let event = Event::new(kind, data);
            let targets = Self::stage(&mut shared, self.history_capacity, event.clone());
            (event, targets)
        };
        self.deliver(&event, targets);
    }

    /// Point-in-time copy of the history ring, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<Event> {
        let shared = self.shared.lock().unwrap();
        shared.history.iter().cloned().collect()
    }

    /// Register a listener with a bounded queue of `capacity` events
    #[must_use]
    pub fn add_listener(&self, capacity: usize) -> EventListener {
        let mut shared = self.shared.lock().unwrap();
        Self::register(&mut shared, capacity)
    }

    /// Snapshot history and register a listener in one critical section
    ///
    /// An event broadcast concurrently with this call lands either in the
    /// returned history or in the listener's queue, never both and never
    /// neither. Streaming consumers must use this rather than pairing
    /// [`Self::history`] with [`Self::add_listener`].
    #[must_use]
    pub fn subscribe(&self, capacity: usize) -> (Vec<Event>, EventListener) {
        let mut shared = self.shared.lock().unwrap();
        let history = shared.history.iter().cloned().collect();
        let listener = Self::register(&mut shared, capacity);
        (history, listener)
    }

    /// Deregister a listener; idempotent
    pub fn remove_listener(&self, id: u64) {
        let mut shared = self.shared.lock().unwrap();
        shared.listeners.retain(|slot| slot.id != id);
    }

    fn register(shared: &mut Shared, capacity: usize) -> EventListener {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
        let id = shared.next_listener_id;
        shared.next_listener_id += 1;
        shared.listeners.push(ListenerSlot { id, tx });
        EventListener { id, rx }
    }

    /// Append to history and copy the listener set, all under the lock
    fn stage(shared: &mut Shared, capacity: usize, event: Event) -> Vec<(u64, SyncSender<Event>)> {
        if shared.history.len() == capacity {
            shared.history.pop_front();
        }
        shared.history.push_back(event);
        shared
            .listeners
            .iter()
            .map(|slot| (slot.id, slot.tx.clone()))
            .collect()
    }

    /// Non-blocking delivery outside the lock; overflowing listeners are dropped
    fn deliver(&self, event: &Event, targets: Vec<(u64, SyncSender<Event>)>) {
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(listener = id, "listener queue overflow, dropping listener");
                    dead.push(id);
                }
                Err(TrySendError::Disconnected(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut shared = self.shared.lock().unwrap();
            shared.listeners.retain(|slot| !dead.contains(&slot.id));
        }
    }
}

/// Merge `patch` into `state`, one level deep for the toggle map
fn merge_patch(state: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if key == TOGGLES_KEY {
            if let (Some(Value::Object(existing)), Value::Object(incoming)) =
                (state.get_mut(TOGGLES_KEY), &value)
            {
                for (name, toggle) in incoming {
                    existing.insert(name.clone(), toggle.clone());
                }
                continue;
            }
        }
        state.insert(key, value);
    }
}

fn default_state() -> Map<String, Value> {
    let mut state = Map::new();
    state.insert(STATE_KEY.to_string(), json!(STATE_IDLE));
    state.insert(TOGGLES_KEY.to_string(), json!({}));
    state
}

fn load_state(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read(path).ok()?;
    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            tracing::warn!(path = %path.display(), "state file is not a JSON object, ignoring");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "state file unreadable, ignoring");
            None
        }
    }
}

/// Write-to-temp-then-rename so a crash mid-write never leaves a torn file
fn persist(path: &Path, state: &Value) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::Persistence(format!("temp file: {e}")))?;
    serde_json::to_writer_pretty(&mut tmp, state)?;
    tmp.write_all(b"\n")?;
    tmp.persist(path)
        .map_err(|e| Error::Persistence(format!("rename: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::RecvTimeoutError;

    use super::*;

    fn temp_store(capacity: usize) -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json"), capacity);
        (dir, store)
    }

    fn patch(raw: Value) -> Map<String, Value> {
        match raw {
            Value::Object(map) => map,
            other => panic!("patch must be an object, got {other}"),
        }
    }

    #[test]
    fn toggles_merge_instead_of_replacing() {
        let (_dir, store) = temp_store(16);
        store.update(patch(json!({"toggles": {"a": true}})));
        let state = store.update(patch(json!({"toggles": {"b": true}})));
        assert_eq!(state["toggles"], json!({"a": true, "b": true}));
    }

    #[test]
    fn top_level_keys_overwrite() {
        let (_dir, store) = temp_store(16);
        store.update(patch(json!({"mood": "curious"})));
        let state = store.update(patch(json!({"mood": "bored"})));
        assert_eq!(state["mood"], json!("bored"));
        assert_eq!(state["state"], json!("idle"));
    }

    #[test]
    fn entering_talking_stamps_last_talk() {
        let (_dir, store) = temp_store(16);
        let state = store.update(patch(json!({"state": "talking"})));
        assert!(state["last_talk"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn provided_last_talk_is_kept() {
        let (_dir, store) = temp_store(16);
        let state = store.update(patch(json!({"state": "talking", "last_talk": 42.0})));
        assert_eq!(state["last_talk"], json!(42.0));
    }

    #[test]
    fn history_never_exceeds_capacity() {
        let (_dir, store) = temp_store(3);
        for i in 0..10 {
            store.record_event("tick", json!({"n": i}));
        }
        let history = store.history();
        assert_eq!(history.len(), 3);
        // Oldest evicted first
        assert_eq!(history[0].data, json!({"n": 7}));
        assert_eq!(history[2].data, json!({"n": 9}));
    }

    #[test]
    fn saturated_listener_is_dropped_not_blocked() {
        let (_dir, store) = temp_store(16);
        let listener = store.add_listener(2);
        store.record_event("tick", json!(1));
        store.record_event("tick", json!(2));
        // Third broadcast overflows the queue and evicts the listener
        store.record_event("tick", json!(3));
        // Further broadcasts must not error
        store.record_event("tick", json!(4));

        assert_eq!(listener.try_recv().unwrap().data, json!(1));
        assert_eq!(listener.try_recv().unwrap().data, json!(2));
        // Sender was dropped on removal, so the queue drains to disconnect
        assert_eq!(listener.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let (_dir, store) = temp_store(16);
        let listener = store.add_listener(8);
        store.remove_listener(listener.id());
        store.remove_listener(listener.id()); // idempotent
        store.record_event("tick", json!(1));
        assert_eq!(listener.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn subscribe_splits_history_and_live_cleanly() {
        let (_dir, store) = temp_store(16);
        store.record_event("early", json!(1));
        let (history, listener) = store.subscribe(8);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, "early");
        assert_eq!(listener.try_recv(), Err(TryRecvError::Empty));

        store.record_event("late", json!(2));
        let live = listener
            .recv_timeout(Duration::from_secs(1))
            .expect("live event");
        assert_eq!(live.kind, "late");
    }

    #[test]
    fn update_events_carry_the_new_snapshot() {
        let (_dir, store) = temp_store(16);
        let (_, listener) = store.subscribe(8);
        store.update(patch(json!({"toggles": {"lamp": true}})));
        let event = listener
            .recv_timeout(Duration::from_secs(1))
            .expect("state event");
        assert_eq!(event.kind, EVENT_STATE);
        assert_eq!(event.data["toggles"]["lamp"], json!(true));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = StateStore::open(&path, 16);
            store.update(patch(json!({"toggles": {"beam": true}, "mood": "chipper"})));
        }
        let reopened = StateStore::open(&path, 16);
        let state = reopened.snapshot();
        assert_eq!(state["toggles"]["beam"], json!(true));
        assert_eq!(state["mood"], json!("chipper"));
    }

    #[test]
    fn corrupt_state_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = StateStore::open(&path, 16);
        assert_eq!(store.snapshot()["state"], json!("idle"));
    }

    #[test]
    fn event_wire_format_is_the_ordered_triple() {
        let event = Event::new("speech", json!({"id": "x"}));
        let wire = serde_json::to_string(&event).unwrap();
        assert!(wire.starts_with("{\"type\":\"speech\",\"data\":"));
        assert!(wire.contains("\"ts\":"));
    }

    #[test]
    fn timeout_elapses_without_events() {
        let (_dir, store) = temp_store(16);
        let listener = store.add_listener(8);
        assert_eq!(
            listener.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
    }
}
