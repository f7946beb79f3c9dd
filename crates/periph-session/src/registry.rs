//! In-memory session table and the single arbitration point for transitions.
//!
//! Every mutation happens inside one `parking_lot` critical section that is
//! never held across an `.await`. Whichever caller's transition reaches the
//! lock first wins; the loser gets `InvalidTransition`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use periph_core::{
    EngineEvent, EventBus, PeriphError, Result, SessionId, SessionKind, SessionState,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::backend::{BackendHandle, BackendOutcome, HandleId};

/// Snapshot of a recording or playback session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub device_id: String,
    pub kind: SessionKind,
    pub state: SessionState,
    /// File path or stream target handed to the backend.
    pub output: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Registry revision at this session's last change.
    pub revision: u64,
}

struct Entry {
    session: Session,
    handle: Option<BackendHandle>,
    /// Completion that arrived before the start was acknowledged.
    deferred: Option<BackendOutcome>,
    reported: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Entry>,
    /// Device id → the session holding its exclusivity slot.
    active: HashMap<String, SessionId>,
    revision: u64,
}

pub struct SessionRegistry {
    inner: Mutex<Inner>,
    revision_tx: watch::Sender<u64>,
    bus: EventBus,
}

impl SessionRegistry {
    pub fn new(bus: EventBus) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            revision_tx,
            bus,
        }
    }

    /// Record a new `Starting` session, claiming the device's slot.
    pub fn create(&self, device_id: &str, kind: SessionKind, output: PathBuf) -> Result<SessionId> {
        let mut inner = self.inner.lock();
        if let Some(holder) = inner.active.get(device_id) {
            return Err(PeriphError::DeviceBusy {
                device_id: device_id.to_string(),
                session_id: holder.to_string(),
            });
        }

        inner.revision += 1;
        let id = SessionId::new();
        let session = Session {
            id,
            device_id: device_id.to_string(),
            kind,
            state: SessionState::Starting,
            output,
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
            revision: inner.revision,
        };
        inner.active.insert(device_id.to_string(), id);
        inner.sessions.insert(
            id,
            Entry {
                session,
                handle: None,
                deferred: None,
                reported: false,
            },
        );
        let revision = inner.revision;
        drop(inner);

        self.revision_tx.send_replace(revision);
        info!(session.id = %id, device.id = device_id, %kind, "session created");
        self.bus.publish(EngineEvent::SessionCreated {
            session_id: id,
            device_id: device_id.to_string(),
            session_kind: kind,
        });
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Result<Session> {
        self.inner
            .lock()
            .sessions
            .get(&id)
            .map(|e| e.session.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Move a session to `to`, enforcing the state machine.
    ///
    /// `detail` becomes `last_error` when moving to `Failed`.
    pub fn transition(&self, id: SessionId, to: SessionState, detail: Option<String>) -> Result<Session> {
        let mut inner = self.inner.lock();
        let (session, events) = Self::apply(&mut inner, id, to, detail)?;
        let revision = inner.revision;
        drop(inner);

        self.announce(revision, events);
        Ok(session)
    }

    /// Commit `Starting → Running` and attach the handle in one step.
    ///
    /// If the session already left `Starting` (cancelled, timed out), the
    /// handle is returned so the caller can release it. A completion deferred
    /// while starting is applied right after the commit.
    pub fn commit_running(
        &self,
        id: SessionId,
        handle: BackendHandle,
    ) -> std::result::Result<Session, (PeriphError, BackendHandle)> {
        let mut inner = self.inner.lock();
        let (mut session, mut events) =
            match Self::apply(&mut inner, id, SessionState::Running, None) {
                Ok(applied) => applied,
                Err(e) => return Err((e, handle)),
            };

        let deferred = inner.sessions.get_mut(&id).and_then(|entry| {
            entry.handle = Some(handle);
            entry.deferred.take()
        });
        if let Some(outcome) = deferred {
            let (to, detail) = outcome_target(outcome);
            if let Ok((after, more)) = Self::apply(&mut inner, id, to, detail) {
                session = after;
                events.extend(more);
            }
        }
        let revision = inner.revision;
        drop(inner);

        self.announce(revision, events);
        Ok(session)
    }

    /// Park a backend completion that raced ahead of the start acknowledgment.
    ///
    /// Only valid while the session is `Starting`.
    pub fn defer_outcome(&self, id: SessionId, outcome: BackendOutcome) -> Result<Session> {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.get_mut(&id).ok_or_else(|| not_found(id))?;
        if entry.session.state != SessionState::Starting {
            let (to, _) = outcome_target(outcome);
            return Err(invalid(id, entry.session.state, to));
        }
        debug!(session.id = %id, ?outcome, "deferring backend outcome until start is acknowledged");
        entry.deferred = Some(outcome);
        Ok(entry.session.clone())
    }

    /// Take the backend handle out of the entry (for stopping or releasing).
    pub fn take_handle(&self, id: SessionId) -> Option<BackendHandle> {
        self.inner
            .lock()
            .sessions
            .get_mut(&id)
            .and_then(|e| e.handle.take())
    }

    pub fn handle_id(&self, id: SessionId) -> Option<HandleId> {
        self.inner
            .lock()
            .sessions
            .get(&id)
            .and_then(|e| e.handle.as_ref().map(BackendHandle::id))
    }

    /// Note that a terminal state has been shown to a caller.
    pub fn mark_reported(&self, id: SessionId) {
        if let Some(entry) = self.inner.lock().sessions.get_mut(&id)
            && entry.session.state.is_terminal()
        {
            entry.reported = true;
        }
    }

    /// Snapshot of sessions, optionally for one device, oldest first.
    pub fn list(&self, device_id: Option<&str>) -> Vec<Session> {
        let inner = self.inner.lock();
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|e| device_id.is_none_or(|d| e.session.device_id == d))
            .map(|e| e.session.clone())
            .collect();
        sessions.sort_by_key(|s| (s.started_at, s.revision));
        sessions
    }

    /// The session currently holding a device's slot.
    pub fn active_session(&self, device_id: &str) -> Option<SessionId> {
        self.inner.lock().active.get(device_id).copied()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// Receiver that changes on every accepted mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Starting` sessions created before `now - timeout`.
    pub fn stale_starting(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<SessionId> {
        let inner = self.inner.lock();
        inner
            .sessions
            .values()
            .filter(|e| e.session.state == SessionState::Starting)
            .filter(|e| older_than(e.session.started_at, now, timeout))
            .map(|e| e.session.id)
            .collect()
    }

    /// Drop terminal sessions past their retention. Runs under the same lock
    /// as transitions, so it never interleaves with one.
    pub fn evict_expired(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
        reported_retention: Duration,
    ) -> Vec<SessionId> {
        let mut inner = self.inner.lock();
        let expired: Vec<SessionId> = inner
            .sessions
            .values()
            .filter_map(|e| {
                let ended = e.session.ended_at?;
                let keep_for = if e.reported {
                    reported_retention.min(retention)
                } else {
                    retention
                };
                older_than(ended, now, keep_for).then_some(e.session.id)
            })
            .collect();

        for id in &expired {
            inner.sessions.remove(id);
        }
        drop(inner);

        for id in &expired {
            debug!(session.id = %id, "session evicted");
            self.bus.publish(EngineEvent::SessionEvicted { session_id: *id });
        }
        expired
    }

    // ── Internals ──────────────────────────────────────────────

    fn apply(
        inner: &mut Inner,
        id: SessionId,
        to: SessionState,
        detail: Option<String>,
    ) -> Result<(Session, Vec<EngineEvent>)> {
        let next_revision = inner.revision + 1;
        let entry = inner.sessions.get_mut(&id).ok_or_else(|| not_found(id))?;
        let from = entry.session.state;
        if !from.can_transition_to(to) {
            return Err(invalid(id, from, to));
        }

        let session = &mut entry.session;
        session.state = to;
        session.revision = next_revision;
        if to == SessionState::Failed {
            session.last_error = Some(detail.unwrap_or_else(|| "backend reported failure".into()));
        }
        if to.is_terminal() {
            session.ended_at = Some(Utc::now());
        }
        let snapshot = session.clone();
        let device_id = snapshot.device_id.clone();

        inner.revision = next_revision;
        if to.is_terminal() && inner.active.get(&device_id) == Some(&id) {
            inner.active.remove(&device_id);
        }

        info!(session.id = %id, device.id = %device_id, %from, %to, revision = next_revision, "session transition");
        let event = EngineEvent::SessionTransitioned {
            session_id: id,
            device_id,
            from,
            to,
            revision: next_revision,
        };
        Ok((snapshot, vec![event]))
    }

    fn announce(&self, revision: u64, events: Vec<EngineEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision_tx.send_replace(revision);
        for event in events {
            self.bus.publish(event);
        }
    }
}

/// Target state for a backend-reported outcome.
pub(crate) fn outcome_target(outcome: BackendOutcome) -> (SessionState, Option<String>) {
    match outcome {
        BackendOutcome::Completed => (SessionState::Completed, None),
        BackendOutcome::Failed(msg) => (SessionState::Failed, Some(msg)),
    }
}

fn older_than(at: DateTime<Utc>, now: DateTime<Utc>, age: Duration) -> bool {
    match chrono::Duration::from_std(age) {
        Ok(age) => now.signed_duration_since(at) >= age,
        Err(_) => false,
    }
}

fn not_found(id: SessionId) -> PeriphError {
    PeriphError::NotFound {
        entity: "session",
        id: id.to_string(),
    }
}

fn invalid(id: SessionId, from: SessionState, to: SessionState) -> PeriphError {
    PeriphError::InvalidTransition {
        entity: "session",
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}
