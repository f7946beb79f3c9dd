//! Scriptable in-memory backends for deterministic tests.
//!
//! No processes, no files. Tests drive completion explicitly through
//! [`MockBackend::complete`] / [`MockBackend::fail`] or let
//! [`MockBackend::auto_complete_after`] do it on a timer.

use async_trait::async_trait;
use parking_lot::Mutex;
use periph_core::{Capability, Device, DeviceClass, PeriphError, Result, SessionId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::backend::{
    BackendHandle, BackendStatus, CancelAck, EventSink, HandleId, PrintOptions, SessionBackend,
    Spooler, SpoolerJobState, StartParams, StartRequest, StorageCatalog,
};

#[derive(Default)]
struct MockState {
    fail_next_start: Option<String>,
    fail_next_stop: Option<String>,
    stop_delay: Option<Duration>,
    auto_complete: Option<Duration>,
    start_gate: Option<Arc<Notify>>,
    /// Sinks captured at start, so tests can push events for a session.
    sinks: HashMap<SessionId, EventSink>,
    handles: HashMap<SessionId, HandleId>,
    status: HashMap<HandleId, BackendStatus>,
}

/// A mock session backend for one device class.
pub struct MockBackend {
    class: DeviceClass,
    devices: Mutex<Vec<Device>>,
    state: Mutex<MockState>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    captures: AtomicUsize,
}

impl MockBackend {
    pub fn new(class: DeviceClass) -> Self {
        Self {
            class,
            devices: Mutex::new(Vec::new()),
            state: Mutex::new(MockState::default()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
        }
    }

    /// Camera backend with `cam0`.
    pub fn camera() -> Self {
        Self::new(DeviceClass::Camera).with_device(
            Device::new("cam0", DeviceClass::Camera, "Mock Camera")
                .with_capability(Capability::Video)
                .with_capability(Capability::Still),
        )
    }

    /// Audio backend with `mic0` (input) and `speaker0` (output).
    pub fn audio() -> Self {
        Self::new(DeviceClass::Audio)
            .with_device(
                Device::new("mic0", DeviceClass::Audio, "Mock Microphone")
                    .with_capability(Capability::AudioInput),
            )
            .with_device(
                Device::new("speaker0", DeviceClass::Audio, "Mock Speaker")
                    .with_capability(Capability::AudioOutput),
            )
    }

    /// Screen backend with `display0`.
    pub fn screen() -> Self {
        Self::new(DeviceClass::Screen).with_device(
            Device::new("display0", DeviceClass::Screen, "Mock Display")
                .with_capability(Capability::Video)
                .with_capability(Capability::Still),
        )
    }

    pub fn with_device(self, device: Device) -> Self {
        self.devices.lock().push(device);
        self
    }

    /// The next `start` returns a backend error.
    pub fn fail_next_start(&self, message: impl Into<String>) {
        self.state.lock().fail_next_start = Some(message.into());
    }

    /// The next `stop` returns a backend error.
    pub fn fail_next_stop(&self, message: impl Into<String>) {
        self.state.lock().fail_next_stop = Some(message.into());
    }

    /// Make every `stop` take this long.
    pub fn set_stop_delay(&self, delay: Duration) {
        self.state.lock().stop_delay = Some(delay);
    }

    /// Hold every subsequent `start` until the returned gate is notified.
    pub fn gate_starts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().start_gate = Some(gate.clone());
        gate
    }

    /// Report natural completion this long after each start.
    pub fn auto_complete_after(&self, after: Duration) {
        self.state.lock().auto_complete = Some(after);
    }

    /// Push a completion event for a session, as process monitoring would.
    pub fn complete(&self, session_id: SessionId) -> bool {
        self.finish(session_id, BackendStatus::Exited {
            success: true,
            detail: None,
        });
        self.sink(session_id)
            .is_some_and(|sink| sink.completed(session_id))
    }

    /// Push a failure event for a session.
    pub fn fail(&self, session_id: SessionId, message: &str) -> bool {
        self.finish(session_id, BackendStatus::Exited {
            success: false,
            detail: Some(message.to_string()),
        });
        self.sink(session_id)
            .is_some_and(|sink| sink.failed(session_id, message))
    }

    /// Mark the session's process as exited without pushing an event.
    /// Only a poll will notice.
    pub fn exit_silently(&self, session_id: SessionId, success: bool) {
        self.finish(session_id, BackendStatus::Exited {
            success,
            detail: (!success).then(|| "exit status 1".to_string()),
        });
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Handles the backend still considers running.
    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .status
            .values()
            .filter(|s| **s == BackendStatus::Running)
            .count()
    }

    fn sink(&self, session_id: SessionId) -> Option<EventSink> {
        self.state.lock().sinks.get(&session_id).cloned()
    }

    fn finish(&self, session_id: SessionId, status: BackendStatus) {
        let mut state = self.state.lock();
        if let Some(handle) = state.handles.get(&session_id).copied() {
            state.status.insert(handle, status);
        }
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    fn class(&self) -> DeviceClass {
        self.class
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.lock().clone())
    }

    fn prepare(&self, device: &Device, params: &StartParams) -> Result<PathBuf> {
        Ok(params.requested_output().map(Path::to_path_buf).unwrap_or_else(|| {
            std::env::temp_dir()
                .join("periph-mock")
                .join(format!("{}-{}.out", device.id, params.kind()))
        }))
    }

    async fn start(&self, request: StartRequest, sink: EventSink) -> Result<BackendHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let session_id = request.session_id;
        let gate = {
            let mut state = self.state.lock();
            state.sinks.insert(session_id, sink.clone());
            state.start_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let (failure, auto_complete) = {
            let mut state = self.state.lock();
            (state.fail_next_start.take(), state.auto_complete)
        };
        if let Some(message) = failure {
            return Err(PeriphError::backend(message));
        }

        let handle = BackendHandle::new(format!("mock:{}", request.device.id));
        {
            let mut state = self.state.lock();
            state.handles.insert(session_id, handle.id());
            state.status.insert(handle.id(), BackendStatus::Running);
        }

        if let Some(after) = auto_complete {
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                sink.completed(session_id);
            });
        }
        Ok(handle)
    }

    async fn stop(&self, handle: BackendHandle) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().stop_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let failure = state.fail_next_stop.take();
        let status = BackendStatus::Exited {
            success: failure.is_none(),
            detail: failure.clone(),
        };
        state.status.insert(handle.id(), status);
        match failure {
            Some(message) => Err(PeriphError::backend(message)),
            None => Ok(()),
        }
    }

    async fn poll(&self, handle: HandleId) -> Result<BackendStatus> {
        Ok(self
            .state
            .lock()
            .status
            .get(&handle)
            .cloned()
            .unwrap_or(BackendStatus::Unknown))
    }

    async fn capture(&self, device: &Device, target: Option<PathBuf>) -> Result<PathBuf> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(target.unwrap_or_else(|| {
            std::env::temp_dir()
                .join("periph-mock")
                .join(format!("{}-capture.jpg", device.id))
        }))
    }
}

// ─── Spooler ────────────────────────────────────────────────────

#[derive(Default)]
struct SpoolerState {
    next_job: u64,
    jobs: HashMap<String, SpoolerJobState>,
    submissions: Vec<(String, PathBuf, PrintOptions)>,
    refuse_cancel: Option<String>,
    fail_next_submit: Option<String>,
}

/// A mock print spooler. Jobs stay `Pending` until a test moves them.
pub struct MockSpooler {
    printers: Mutex<Vec<Device>>,
    state: Mutex<SpoolerState>,
}

impl MockSpooler {
    /// Spooler with `printer1` (duplex, color, PDF).
    pub fn new() -> Self {
        Self {
            printers: Mutex::new(vec![
                Device::new("printer1", DeviceClass::Printer, "Mock Printer")
                    .with_capability(Capability::Duplex)
                    .with_capability(Capability::Color)
                    .with_capability(Capability::Pdf),
            ]),
            state: Mutex::new(SpoolerState::default()),
        }
    }

    pub fn with_printer(self, printer: Device) -> Self {
        self.printers.lock().push(printer);
        self
    }

    /// Move a job to a new spooler state.
    pub fn set_state(&self, job_id: &str, state: SpoolerJobState) {
        self.state.lock().jobs.insert(job_id.to_string(), state);
    }

    /// Refuse every cancel with `reason`.
    pub fn refuse_cancel(&self, reason: impl Into<String>) {
        self.state.lock().refuse_cancel = Some(reason.into());
    }

    pub fn fail_next_submit(&self, message: impl Into<String>) {
        self.state.lock().fail_next_submit = Some(message.into());
    }

    /// `(printer id, file, options)` for every accepted submission.
    pub fn submissions(&self) -> Vec<(String, PathBuf, PrintOptions)> {
        self.state.lock().submissions.clone()
    }
}

impl Default for MockSpooler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Spooler for MockSpooler {
    async fn printers(&self) -> Result<Vec<Device>> {
        Ok(self.printers.lock().clone())
    }

    async fn submit(&self, printer: &Device, file: &Path, options: &PrintOptions) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next_submit.take() {
            return Err(PeriphError::backend(message));
        }
        state.next_job += 1;
        let job_id = format!("{}-{}", printer.id, state.next_job);
        state.jobs.insert(job_id.clone(), SpoolerJobState::Pending);
        state
            .submissions
            .push((printer.id.clone(), file.to_path_buf(), options.clone()));
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<SpoolerJobState> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| PeriphError::backend(format!("spooler does not know job {job_id}")))
    }

    async fn cancel(&self, job_id: &str) -> Result<CancelAck> {
        let mut state = self.state.lock();
        if let Some(reason) = state.refuse_cancel.clone() {
            return Ok(CancelAck::Refused(reason));
        }
        match state.jobs.get(job_id) {
            None => Err(PeriphError::backend(format!("spooler does not know job {job_id}"))),
            Some(SpoolerJobState::Completed) => {
                Ok(CancelAck::Refused("job already completed".into()))
            }
            Some(_) => {
                state
                    .jobs
                    .insert(job_id.to_string(), SpoolerJobState::Cancelled);
                Ok(CancelAck::Accepted)
            }
        }
    }
}

// ─── Storage ────────────────────────────────────────────────────

/// A fixed list of volumes.
#[derive(Default)]
pub struct MockStorage {
    volumes: Vec<Device>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            volumes: vec![
                Device::new("sdb1", DeviceClass::Storage, "USB Stick")
                    .with_capability(Capability::Removable)
                    .with_detail("mount_point", "/media/usb"),
            ],
        }
    }
}

#[async_trait]
impl StorageCatalog for MockStorage {
    async fn volumes(&self) -> Result<Vec<Device>> {
        Ok(self.volumes.clone())
    }
}
