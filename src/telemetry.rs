//! Fire-and-forget event stream
//!
//! Events go through a bounded channel to a writer thread that appends JSON
//! lines to `events.jsonl`. [`EventBus::emit`] never blocks and never fails;
//! when the buffer is full the event is dropped and counted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub session: Uuid,
    pub kind: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

pub struct EventBus {
    session: Uuid,
    sender: Option<SyncSender<Event>>,
    dropped: Arc<AtomicU64>,
    writer: Option<JoinHandle<()>>,
}

impl EventBus {
    /// Start the writer thread appending to `<state_dir>/events.jsonl`.
    pub fn start(state_dir: &Path) -> Self {
        Self::with_capacity(state_dir.join(EVENTS_FILE), EVENT_BUFFER)
    }

    pub fn with_capacity(path: PathBuf, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Event>(capacity);
        let writer = std::thread::Builder::new()
            .name("patchwarden-events".to_string())
            .spawn(move || write_events(&path, receiver));
        match writer {
            Ok(handle) => Self {
                session: Uuid::new_v4(),
                sender: Some(sender),
                dropped: Arc::new(AtomicU64::new(0)),
                writer: Some(handle),
            },
            Err(err) => {
                warn!(error = %err, "event writer did not start; events are discarded");
                Self::disabled()
            }
        }
    }

    /// A bus that accepts and discards everything.
    pub fn disabled() -> Self {
        Self {
            session: Uuid::new_v4(),
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
            writer: None,
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn emit(&self, kind: &str, data: serde_json::Value) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        let event = Event {
            at: Utc::now(),
            session: self.session,
            kind: kind.to_string(),
            data,
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events discarded because the buffer was full or the writer had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush queued events and stop the writer.
    pub fn shutdown(mut self) -> u64 {
        self.finish();
        self.dropped()
    }

    fn finish(&mut self) {
        self.sender.take();
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.finish();
    }
}

fn write_events(path: &Path, receiver: mpsc::Receiver<Event>) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "cannot open event log");
            // Keep draining so senders never see a full buffer on our account.
            for _ in receiver {}
            return;
        }
    };
    let mut out = BufWriter::new(file);
    let mut written = 0u64;
    for event in receiver {
        let Ok(line) = serde_json::to_string(&event) else {
            continue;
        };
        if writeln!(out, "{line}").is_err() {
            continue;
        }
        written += 1;
    }
    let _ = out.flush();
    debug!(written, "event writer stopped");
}
