//! The backend boundary: what the engine asks of device-class adapters.
//!
//! Adapters wrap external processes, libraries or spoolers. They never touch
//! the registry; they hand back an opaque [`BackendHandle`] and push natural
//! completion through an [`EventSink`].

use async_trait::async_trait;
use periph_core::{Device, DeviceClass, PeriphError, Result, SessionId, SessionKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

// ─── Start parameters ───────────────────────────────────────────

/// Options for a camera recording.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOptions {
    /// Frames per second (backend default when unset).
    pub fps: Option<f64>,
    /// Fixed duration; `None` records until stopped.
    pub duration_secs: Option<u64>,
    /// File or directory for the recording.
    pub save_path: Option<PathBuf>,
}

/// Options for a microphone recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioRecordOptions {
    /// Fixed duration; `None` records until stopped.
    pub duration_secs: Option<f64>,
    pub sample_rate: u32,
    pub channels: u16,
    pub output_file: Option<PathBuf>,
}

impl Default for AudioRecordOptions {
    fn default() -> Self {
        Self {
            duration_secs: None,
            sample_rate: 44_100,
            channels: 1,
            output_file: None,
        }
    }
}

/// Options for audio playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackOptions {
    pub file: PathBuf,
}

/// Options for a screen recording.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenOptions {
    pub fps: Option<u32>,
    /// Capture region as `WxH+X+Y`; full screen when unset.
    pub region: Option<String>,
    /// Also capture the default audio input.
    pub audio: bool,
    pub duration_secs: Option<u64>,
    pub save_path: Option<PathBuf>,
}

/// Parameters of a session start. The variant decides the session kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartParams {
    Video(VideoOptions),
    AudioRecord(AudioRecordOptions),
    Playback(PlaybackOptions),
    Screen(ScreenOptions),
}

impl StartParams {
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Video(_) => SessionKind::VideoRecording,
            Self::AudioRecord(_) => SessionKind::AudioRecording,
            Self::Playback(_) => SessionKind::AudioPlayback,
            Self::Screen(_) => SessionKind::ScreenRecording,
        }
    }

    /// Output location the caller asked for, if any.
    pub fn requested_output(&self) -> Option<&Path> {
        match self {
            Self::Video(o) => o.save_path.as_deref(),
            Self::AudioRecord(o) => o.output_file.as_deref(),
            Self::Playback(o) => Some(o.file.as_path()),
            Self::Screen(o) => o.save_path.as_deref(),
        }
    }
}

/// Everything an adapter needs to begin a session.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: SessionId,
    pub device: Device,
    pub params: StartParams,
    /// Output descriptor resolved by [`SessionBackend::prepare`].
    pub output: PathBuf,
}

// ─── Handles ────────────────────────────────────────────────────

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Copyable reference to a live backend handle, used for polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Opaque token for a running backend operation.
///
/// Not `Clone`: the registry entry owns it, and stopping moves it back into
/// the adapter.
#[derive(Debug)]
pub struct BackendHandle {
    id: HandleId,
    label: String,
}

impl BackendHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: HandleId(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)),
            label: label.into(),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// What an adapter reports when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Running,
    Exited { success: bool, detail: Option<String> },
    /// The adapter no longer knows the handle.
    Unknown,
}

// ─── Completion events ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOutcome {
    Completed,
    Failed(String),
}

/// Asynchronous completion pushed by a backend's own monitoring.
#[derive(Debug, Clone)]
pub struct BackendEvent {
    pub session_id: SessionId,
    pub outcome: BackendOutcome,
}

/// Channel adapters use to report natural completion or failure.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BackendEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the engine has gone away.
    pub fn report(&self, session_id: SessionId, outcome: BackendOutcome) -> bool {
        self.tx.send(BackendEvent { session_id, outcome }).is_ok()
    }

    pub fn completed(&self, session_id: SessionId) -> bool {
        self.report(session_id, BackendOutcome::Completed)
    }

    pub fn failed(&self, session_id: SessionId, message: impl Into<String>) -> bool {
        self.report(session_id, BackendOutcome::Failed(message.into()))
    }
}

// ─── Adapter traits ─────────────────────────────────────────────

/// Adapter for a session-capable device class (camera, audio, screen).
#[async_trait]
pub trait SessionBackend: Send + Sync {
    fn class(&self) -> DeviceClass;

    /// Enumerate devices. Each call returns a fresh snapshot.
    async fn devices(&self) -> Result<Vec<Device>>;

    /// Validate parameters and resolve the output target. Runs before the
    /// session is recorded, so it must stay cheap.
    fn prepare(&self, device: &Device, params: &StartParams) -> Result<PathBuf>;

    /// Begin the operation. Returns once the process or stream is running.
    async fn start(&self, request: StartRequest, sink: EventSink) -> Result<BackendHandle>;

    /// Stop the operation and wait for the adapter to acknowledge.
    async fn stop(&self, handle: BackendHandle) -> Result<()>;

    async fn poll(&self, handle: HandleId) -> Result<BackendStatus>;

    /// One-shot capture (still image, screenshot). No session involved.
    async fn capture(&self, device: &Device, _target: Option<PathBuf>) -> Result<PathBuf> {
        Err(PeriphError::backend(format!(
            "{} backend cannot capture stills from {}",
            self.class(),
            device.id
        )))
    }
}

/// How a print job should be rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintFormat {
    /// Let the spooler detect the document type.
    #[default]
    Auto,
    /// Submit the file as a PDF document.
    Pdf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintOptions {
    pub copies: u32,
    pub double_sided: bool,
    pub color: bool,
    pub format: PrintFormat,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            copies: 1,
            double_sided: false,
            color: true,
            format: PrintFormat::Auto,
        }
    }
}

/// Job state as the spooler reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpoolerJobState {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Aborted(String),
}

/// Spooler answer to a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelAck {
    Accepted,
    Refused(String),
}

/// Printer spooler boundary. Authoritative for job state.
#[async_trait]
pub trait Spooler: Send + Sync {
    async fn printers(&self) -> Result<Vec<Device>>;

    /// Submit a file; returns the spooler-assigned job id.
    async fn submit(&self, printer: &Device, file: &Path, options: &PrintOptions) -> Result<String>;

    async fn status(&self, job_id: &str) -> Result<SpoolerJobState>;

    async fn cancel(&self, job_id: &str) -> Result<CancelAck>;
}

/// Enumeration-only view of storage volumes.
#[async_trait]
pub trait StorageCatalog: Send + Sync {
    async fn volumes(&self) -> Result<Vec<Device>>;
}

// ─── Dispatch table ─────────────────────────────────────────────

/// One adapter slot per device class; dispatch is by class tag.
#[derive(Clone, Default)]
pub struct BackendSet {
    camera: Option<Arc<dyn SessionBackend>>,
    audio: Option<Arc<dyn SessionBackend>>,
    screen: Option<Arc<dyn SessionBackend>>,
    printer: Option<Arc<dyn Spooler>>,
    storage: Option<Arc<dyn StorageCatalog>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.camera = Some(backend);
        self
    }

    pub fn with_audio(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.audio = Some(backend);
        self
    }

    pub fn with_screen(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.screen = Some(backend);
        self
    }

    pub fn with_printer(mut self, spooler: Arc<dyn Spooler>) -> Self {
        self.printer = Some(spooler);
        self
    }

    pub fn with_storage(mut self, catalog: Arc<dyn StorageCatalog>) -> Self {
        self.storage = Some(catalog);
        self
    }

    /// Session adapter for a class; `None` for printer/storage or an empty slot.
    pub fn session_backend(&self, class: DeviceClass) -> Option<Arc<dyn SessionBackend>> {
        match class {
            DeviceClass::Camera => self.camera.clone(),
            DeviceClass::Audio => self.audio.clone(),
            DeviceClass::Screen => self.screen.clone(),
            DeviceClass::Printer | DeviceClass::Storage => None,
        }
    }

    pub fn spooler(&self) -> Option<Arc<dyn Spooler>> {
        self.printer.clone()
    }

    pub fn storage(&self) -> Option<Arc<dyn StorageCatalog>> {
        self.storage.clone()
    }
}
