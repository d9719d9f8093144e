//! Session event surface: a broadcast stream of serializable events with a
//! per-session monotonically increasing sequence number. Delivery is
//! at-least-once; consumers key idempotence on `(session_id, seq)`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ModeSelected { mode: String },
    TodoBuilt { item_ids: Vec<String> },
    ItemStarted { item_id: String },
    ToolDispatched { item_id: String, qualified_name: String },
    ToolResult { item_id: String, request_id: u64, success: bool },
    ItemVerified { item_id: String, passed: bool },
    ItemDone { item_id: String },
    ItemFailed { item_id: String, reason: String },
    ItemSkipped { item_id: String },
    SessionSummary { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub session_id: String,
    pub seq: u64,
    pub event: SessionEvent,
}

pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    seqs: Mutex<HashMap<String, u64>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            tx,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Publish one event; lagging subscribers drop, they are never awaited.
    pub fn emit(&self, session_id: &str, event: SessionEvent) {
        let seq = {
            let mut seqs = self.seqs.lock().unwrap();
            let counter = seqs.entry(session_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let _ = self.tx.send(EventEnvelope {
            session_id: session_id.to_string(),
            seq,
            event,
        });
    }

    /// Forget a finished session's counter.
    pub fn forget(&self, session_id: &str) {
        self.seqs.lock().unwrap().remove(session_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
