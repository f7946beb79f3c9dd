//! The session lifecycle engine.
//!
//! Orchestrates `start → running → stopping → terminal` on top of the
//! [`SessionRegistry`]. Backend calls run outside every lock; the registry
//! decides which of several racing transitions is accepted. A loser observes
//! `InvalidTransition`, which the engine swallows where the race is expected.

use chrono::Utc;
use parking_lot::Mutex;
use periph_config::PeriphConfig;
use periph_core::{
    Capability, DeviceClass, EngineEvent, EventBus, PeriphError, Result, SessionId, SessionState,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    BackendEvent, BackendHandle, BackendOutcome, BackendSet, BackendStatus, EventSink,
    SessionBackend, StartParams, StartRequest,
};
use crate::catalog::DeviceCatalog;
use crate::registry::{Session, SessionRegistry, outcome_target};
use crate::status::SessionStatus;

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// `Starting` sessions failed for exceeding the start timeout.
    pub timed_out: Vec<SessionId>,
    /// Terminal sessions removed after retention.
    pub evicted: Vec<SessionId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.evicted.is_empty()
    }
}

pub struct SessionEngine {
    config: Arc<PeriphConfig>,
    catalog: DeviceCatalog,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendEvent>>>,
}

impl SessionEngine {
    pub fn new(config: PeriphConfig, backends: BackendSet) -> Self {
        Self::with_bus(config, backends, EventBus::default())
    }

    pub fn with_bus(config: PeriphConfig, backends: BackendSet, bus: EventBus) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let catalog = DeviceCatalog::new(config.devices.clone(), backends);
        Self {
            config: Arc::new(config),
            catalog,
            registry: Arc::new(SessionRegistry::new(bus.clone())),
            bus,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn config(&self) -> &PeriphConfig {
        &self.config
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Sink handed to backends; events land in the engine's pump.
    pub fn event_sink(&self) -> EventSink {
        EventSink::new(self.events_tx.clone())
    }

    // ── Start ──────────────────────────────────────────────────

    /// Start a session on `device_id`. The session kind follows from `params`.
    ///
    /// A backend start error leaves the session queryable in `Failed` and
    /// returns `Backend` carrying its id. A start that is not acknowledged
    /// within `sessions.start_timeout_secs` is failed and returns `Timeout`.
    pub async fn start_session(&self, device_id: &str, params: StartParams) -> Result<SessionId> {
        let kind = params.kind();
        let class = kind.device_class();
        self.catalog.ensure_enabled(class)?;
        let backend = self.backend_for(class)?;
        let device = self.catalog.find(class, device_id).await?;

        let required = kind.required_capability();
        if !device.supports(required) {
            return Err(PeriphError::InvalidArgument {
                tool: kind.as_str().to_string(),
                reason: format!("device {} does not support {:?}", device.id, required),
            });
        }

        let output = backend.prepare(&device, &params)?;
        let session_id = self.registry.create(&device.id, kind, output.clone())?;
        let request = StartRequest {
            session_id,
            device,
            params,
            output,
        };

        let start_timeout = self.config.sessions.start_timeout();
        match tokio::time::timeout(start_timeout, backend.start(request, self.event_sink())).await {
            Ok(Ok(handle)) => self.acknowledge_start(session_id, handle, backend),
            Ok(Err(e)) => {
                let message = backend_message(e);
                warn!(session.id = %session_id, device.id = device_id, error = %message, "backend start failed");
                self.fail_quietly(session_id, message.clone());
                Err(PeriphError::Backend {
                    message,
                    session_id: Some(session_id.to_string()),
                })
            }
            Err(_) => {
                let after_secs = start_timeout.as_secs();
                warn!(session.id = %session_id, device.id = device_id, after_secs, "backend start timed out");
                self.fail_quietly(
                    session_id,
                    format!("start not acknowledged within {after_secs}s"),
                );
                Err(PeriphError::Timeout {
                    operation: format!("start {kind} on {device_id}"),
                    after_secs,
                })
            }
        }
    }

    fn acknowledge_start(
        &self,
        session_id: SessionId,
        handle: BackendHandle,
        backend: Arc<dyn SessionBackend>,
    ) -> Result<SessionId> {
        match self.registry.commit_running(session_id, handle) {
            Ok(_) => Ok(session_id),
            Err((e, handle)) => {
                // Cancelled or timed out while the backend was starting.
                debug!(session.id = %session_id, error = %e, "late start acknowledgment rejected");
                self.release(backend, handle);
                let session = self.registry.get(session_id)?;
                match session.state {
                    SessionState::Cancelled => Ok(session_id),
                    _ => Err(PeriphError::Timeout {
                        operation: format!("start {}", session.kind),
                        after_secs: self.config.sessions.start_timeout_secs,
                    }),
                }
            }
        }
    }

    // ── Stop / cancel ──────────────────────────────────────────

    /// Stop a session and return its terminal snapshot.
    ///
    /// Terminal sessions come back unchanged. A `Starting` session is
    /// cancelled; a `Stopping` one is awaited.
    pub async fn stop_session(&self, id: SessionId) -> Result<Session> {
        let session = self.registry.get(id)?;
        let settled = match session.state {
            state if state.is_terminal() => session,
            SessionState::Starting => self.cancel_session(id).await?,
            SessionState::Stopping => {
                self.wait_terminal(id, self.config.sessions.stop_timeout())
                    .await?
            }
            _ => self.stop_running(session).await?,
        };
        self.registry.mark_reported(id);
        Ok(settled)
    }

    async fn stop_running(&self, session: Session) -> Result<Session> {
        let id = session.id;
        let backend = self.backend_for(session.kind.device_class())?;

        if let Err(e) = self.registry.transition(id, SessionState::Stopping, None) {
            if !e.is_invalid_transition() {
                return Err(e);
            }
            debug!(session.id = %id, "stop lost the race to another transition");
            return self
                .wait_terminal(id, self.config.sessions.stop_timeout())
                .await;
        }

        let Some(handle) = self.registry.take_handle(id) else {
            return self.settle(id, SessionState::Completed, None);
        };

        let stop_timeout = self.config.sessions.stop_timeout();
        let result = match tokio::time::timeout(stop_timeout, backend.stop(handle)).await {
            Ok(result) => result,
            Err(_) => Err(PeriphError::Timeout {
                operation: format!("stop session {id}"),
                after_secs: stop_timeout.as_secs(),
            }),
        };

        match result {
            Ok(()) => self.settle(id, SessionState::Completed, None),
            Err(e) => {
                warn!(session.id = %id, error = %e, "backend stop failed");
                let session = self.settle(id, SessionState::Failed, Some(e.to_string()))?;
                if session.state != SessionState::Failed {
                    // A backend completion was committed first.
                    return Ok(session);
                }
                Err(match e {
                    timeout @ PeriphError::Timeout { .. } => timeout,
                    other => PeriphError::Backend {
                        message: backend_message(other),
                        session_id: Some(id.to_string()),
                    },
                })
            }
        }
    }

    /// Cancel a `Starting` or `Running` session.
    ///
    /// Cancelling a terminal session, or losing the race to a natural
    /// completion, returns the current snapshot with no effect.
    pub async fn cancel_session(&self, id: SessionId) -> Result<Session> {
        let session = self.registry.get(id)?;
        if session.state.is_terminal() {
            return Ok(session);
        }

        match self.registry.transition(id, SessionState::Cancelled, None) {
            Ok(cancelled) => {
                if let Some(handle) = self.registry.take_handle(id)
                    && let Ok(backend) = self.backend_for(cancelled.kind.device_class())
                {
                    self.release(backend, handle);
                }
                Ok(cancelled)
            }
            Err(e) if e.is_invalid_transition() => {
                let current = self.registry.get(id)?;
                if current.state.is_terminal() {
                    debug!(session.id = %id, state = %current.state, "cancel lost the race to completion");
                    Ok(current)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    // ── Backend events ─────────────────────────────────────────

    /// Apply a completion pushed by a backend's own monitoring.
    ///
    /// Safe to call concurrently with stop and cancel. An outcome that
    /// arrives while the start is still unacknowledged is applied when the
    /// start commits.
    pub fn report_backend_event(&self, event: BackendEvent) -> Result<Session> {
        let BackendEvent {
            session_id: id,
            outcome,
        } = event;

        if self.registry.get(id)?.state == SessionState::Starting {
            match self.registry.defer_outcome(id, outcome.clone()) {
                Ok(session) => return Ok(session),
                Err(e) if e.is_invalid_transition() => {}
                Err(e) => return Err(e),
            }
        }

        let (to, detail) = outcome_target(outcome);
        let session = self.registry.transition(id, to, detail)?;
        // The process is gone; the handle has nothing left to stop.
        drop(self.registry.take_handle(id));
        Ok(session)
    }

    /// Drain pending backend events without the background pump.
    pub fn drain_events(&self) -> usize {
        let mut guard = self.events_rx.lock();
        let Some(rx) = guard.as_mut() else {
            return 0;
        };
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            self.dispatch_event(event);
            count += 1;
        }
        count
    }

    fn dispatch_event(&self, event: BackendEvent) {
        let id = event.session_id;
        match self.report_backend_event(event) {
            Ok(session) => debug!(session.id = %id, state = %session.state, "backend event applied"),
            Err(e) if e.is_invalid_transition() => {
                debug!(session.id = %id, error = %e, "backend event lost the race")
            }
            Err(e) => warn!(session.id = %id, error = %e, "backend event rejected"),
        }
    }

    // ── Queries ────────────────────────────────────────────────

    /// Ask the backend about a `Running` session and commit an exit it reports.
    pub async fn poll_session(&self, id: SessionId) -> Result<Session> {
        let session = self.registry.get(id)?;
        if session.state != SessionState::Running {
            return Ok(session);
        }
        let Some(handle) = self.registry.handle_id(id) else {
            return Ok(session);
        };

        let backend = self.backend_for(session.kind.device_class())?;
        let outcome = match backend.poll(handle).await? {
            BackendStatus::Running => return Ok(session),
            BackendStatus::Exited { success: true, .. } => BackendOutcome::Completed,
            BackendStatus::Exited {
                success: false,
                detail,
            } => BackendOutcome::Failed(
                detail.unwrap_or_else(|| "backend process exited with an error".into()),
            ),
            BackendStatus::Unknown => {
                BackendOutcome::Failed(format!("backend no longer tracks handle {handle}"))
            }
        };

        match self.report_backend_event(BackendEvent {
            session_id: id,
            outcome,
        }) {
            Ok(session) => Ok(session),
            Err(e) if e.is_invalid_transition() => self.registry.get(id),
            Err(e) => Err(e),
        }
    }

    /// Poll every `Running` session. Catches backends that exit without
    /// pushing an event. Returns the sessions found to have ended.
    pub async fn poll_running(&self) -> Vec<SessionId> {
        let running: Vec<SessionId> = self
            .registry
            .list(None)
            .into_iter()
            .filter(|s| s.state == SessionState::Running)
            .map(|s| s.id)
            .collect();

        let mut ended = Vec::new();
        for id in running {
            match self.poll_session(id).await {
                Ok(session) if session.state.is_terminal() => {
                    debug!(session.id = %id, state = %session.state, "poll found session ended");
                    ended.push(id);
                }
                Ok(_) => {}
                Err(e) => debug!(session.id = %id, error = %e, "session poll failed"),
            }
        }
        ended
    }

    /// Caller-facing status. Marks terminal sessions as reported.
    pub fn status(&self, id: SessionId) -> Result<SessionStatus> {
        let session = self.registry.get(id)?;
        self.registry.mark_reported(id);
        Ok(SessionStatus::from_session(&session, Utc::now()))
    }

    pub fn list_sessions(&self, device_id: Option<&str>) -> Vec<SessionStatus> {
        let now = Utc::now();
        self.registry
            .list(device_id)
            .iter()
            .map(|s| SessionStatus::from_session(s, now))
            .collect()
    }

    /// Wait until the session is terminal, bounded by `timeout`.
    pub async fn wait_terminal(&self, id: SessionId, timeout: Duration) -> Result<Session> {
        match tokio::time::timeout(timeout, self.until_terminal(id)).await {
            Ok(result) => result,
            Err(_) => Err(PeriphError::Timeout {
                operation: format!("wait for session {id}"),
                after_secs: timeout.as_secs(),
            }),
        }
    }

    async fn until_terminal(&self, id: SessionId) -> Result<Session> {
        let mut revisions = self.registry.subscribe();
        loop {
            let session = self.registry.get(id)?;
            if session.state.is_terminal() {
                return Ok(session);
            }
            if revisions.changed().await.is_err() {
                return self.registry.get(id);
            }
        }
    }

    // ── One-shot capture ───────────────────────────────────────

    /// Still image or screenshot. No session is created, and a device busy
    /// with a recording is not blocked.
    pub async fn capture(
        &self,
        class: DeviceClass,
        device_id: &str,
        target: Option<PathBuf>,
    ) -> Result<PathBuf> {
        self.catalog.ensure_enabled(class)?;
        let backend = self.backend_for(class)?;
        let device = self.catalog.find(class, device_id).await?;
        if !device.supports(Capability::Still) {
            return Err(PeriphError::InvalidArgument {
                tool: format!("capture_{class}"),
                reason: format!("device {} cannot capture stills", device.id),
            });
        }

        let limit = self.config.sessions.start_timeout();
        match tokio::time::timeout(limit, backend.capture(&device, target)).await {
            Ok(result) => {
                let path = result?;
                info!(device.id = device_id, path = %path.display(), "captured still");
                Ok(path)
            }
            Err(_) => Err(PeriphError::Timeout {
                operation: format!("capture on {device_id}"),
                after_secs: limit.as_secs(),
            }),
        }
    }

    // ── Maintenance ────────────────────────────────────────────

    /// Fail stale `Starting` sessions and evict expired terminal ones.
    pub fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let sessions = &self.config.sessions;
        let mut report = SweepReport::default();

        for id in self.registry.stale_starting(now, sessions.start_timeout()) {
            let detail = format!(
                "start not acknowledged within {}s",
                sessions.start_timeout_secs
            );
            match self.registry.transition(id, SessionState::Failed, Some(detail)) {
                Ok(_) => {
                    warn!(session.id = %id, "session start timed out");
                    report.timed_out.push(id);
                }
                Err(e) => debug!(session.id = %id, error = %e, "timeout lost the race"),
            }
        }

        report.evicted = self.registry.evict_expired(
            now,
            sessions.retention(),
            sessions.reported_retention(),
        );

        if !report.is_empty() {
            info!(
                timed_out = report.timed_out.len(),
                evicted = report.evicted.len(),
                "session sweep"
            );
            self.bus.publish(EngineEvent::Sweep {
                timestamp: now,
                timed_out: report.timed_out.len(),
                evicted: report.evicted.len(),
            });
        }
        report
    }

    /// Stop or cancel every active session. Used on shutdown.
    pub async fn stop_all(&self) -> usize {
        let active: Vec<Session> = self
            .registry
            .list(None)
            .into_iter()
            .filter(|s| s.state.is_active())
            .collect();

        let mut stopped = 0;
        for session in active {
            match self.stop_session(session.id).await {
                Ok(_) => stopped += 1,
                Err(e) => warn!(session.id = %session.id, error = %e, "failed to stop session on shutdown"),
            }
        }
        stopped
    }

    /// Run the backend event pump and the periodic sweep until `token` fires.
    pub fn spawn_background(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let events = self.events_rx.lock().take();

        tokio::spawn(async move {
            let Some(mut events) = events else {
                warn!("session engine background already running");
                return;
            };
            let mut ticker = tokio::time::interval(engine.config.sessions.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                sweep_secs = engine.config.sessions.sweep_interval().as_secs(),
                "session engine started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(event) = events.recv() => engine.dispatch_event(event),
                    _ = ticker.tick() => {
                        engine.sweep();
                        engine.poll_running().await;
                    }
                }
            }

            engine.stop_all().await;
            engine.bus.publish(EngineEvent::Shutdown);
            info!("session engine stopped");
        })
    }

    // ── Internals ──────────────────────────────────────────────

    fn backend_for(&self, class: DeviceClass) -> Result<Arc<dyn SessionBackend>> {
        self.catalog
            .backends()
            .session_backend(class)
            .ok_or_else(|| PeriphError::backend(format!("no {class} backend is available")))
    }

    /// Commit a terminal state, or return whatever terminal state won.
    fn settle(&self, id: SessionId, to: SessionState, detail: Option<String>) -> Result<Session> {
        match self.registry.transition(id, to, detail) {
            Ok(session) => Ok(session),
            Err(e) if e.is_invalid_transition() => {
                debug!(session.id = %id, %to, "settle lost the race");
                self.registry.get(id)
            }
            Err(e) => Err(e),
        }
    }

    fn fail_quietly(&self, id: SessionId, detail: String) {
        if let Err(e) = self.registry.transition(id, SessionState::Failed, Some(detail)) {
            debug!(session.id = %id, error = %e, "session already settled");
        }
    }

    /// Stop a handle nobody is waiting on.
    fn release(&self, backend: Arc<dyn SessionBackend>, handle: BackendHandle) {
        let handle_id = handle.id();
        tokio::spawn(async move {
            if let Err(e) = backend.stop(handle).await {
                warn!(handle = %handle_id, error = %e, "failed to release backend handle");
            }
        });
    }
}

fn backend_message(err: PeriphError) -> String {
    match err {
        PeriphError::Backend { message, .. } => message,
        other => other.to_string(),
    }
}
