use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{JobState, SessionId, SessionKind, SessionState};

/// Lifecycle events published by the session engine and the job poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    // ── Session lifecycle ──────────────────────────────────────
    SessionCreated {
        session_id: SessionId,
        device_id: String,
        session_kind: SessionKind,
    },
    SessionTransitioned {
        session_id: SessionId,
        device_id: String,
        from: SessionState,
        to: SessionState,
        revision: u64,
    },
    SessionEvicted {
        session_id: SessionId,
    },

    // ── Print jobs ─────────────────────────────────────────────
    JobSubmitted {
        job_id: String,
        device_id: String,
    },
    JobUpdated {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    // ── System ─────────────────────────────────────────────────
    Sweep {
        timestamp: DateTime<Utc>,
        timed_out: usize,
        evicted: usize,
    },
    Shutdown,
}

/// A broadcast-based event bus for engine observers.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<EngineEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
