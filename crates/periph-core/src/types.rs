use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ── Devices ────────────────────────────────────────────────────

/// The closed set of peripheral classes periph knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Camera,
    Audio,
    Screen,
    Printer,
    Storage,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 5] = [
        DeviceClass::Camera,
        DeviceClass::Audio,
        DeviceClass::Screen,
        DeviceClass::Printer,
        DeviceClass::Storage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Audio => "audio",
            Self::Screen => "screen",
            Self::Printer => "printer",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a device can do. Reported by enumeration, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Video,
    Still,
    AudioInput,
    AudioOutput,
    Duplex,
    Color,
    Pdf,
    Removable,
}

/// Immutable snapshot of one enumerated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub class: DeviceClass,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Backend-specific details (path, host API, resolution, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl Device {
    pub fn new(id: impl Into<String>, class: DeviceClass, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class,
            name: name.into(),
            capabilities: Vec::new(),
            details: serde_json::Map::new(),
        }
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        if !self.capabilities.contains(&cap) {
            self.capabilities.push(cap);
        }
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

// ── Sessions ───────────────────────────────────────────────────

/// Locally generated identifier of a recording or playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Session-based operations. Still capture is synchronous and has no kind here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    VideoRecording,
    AudioRecording,
    AudioPlayback,
    ScreenRecording,
}

impl SessionKind {
    /// The device class whose backend runs this kind of session.
    pub fn device_class(&self) -> DeviceClass {
        match self {
            Self::VideoRecording => DeviceClass::Camera,
            Self::AudioRecording | Self::AudioPlayback => DeviceClass::Audio,
            Self::ScreenRecording => DeviceClass::Screen,
        }
    }

    /// Capability the target device must report.
    pub fn required_capability(&self) -> Capability {
        match self {
            Self::VideoRecording | Self::ScreenRecording => Capability::Video,
            Self::AudioRecording => Capability::AudioInput,
            Self::AudioPlayback => Capability::AudioOutput,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoRecording => "video_recording",
            Self::AudioRecording => "audio_recording",
            Self::AudioPlayback => "audio_playback",
            Self::ScreenRecording => "screen_recording",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a session.
///
/// ```text
/// Starting ──► Running ──► Stopping ──► Completed
///    │            │            └──────► Failed
///    │            ├──────────────────► Completed | Failed
///    └────────────┴──────────────────► Cancelled   (client only)
/// Starting ─────────────────────────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active states occupy the device's exclusivity slot.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Running | Failed | Cancelled)
                | (Running, Stopping | Completed | Failed | Cancelled)
                | (Stopping, Completed | Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Print jobs ─────────────────────────────────────────────────

/// State of a print job, mirrored from the spooler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Printing,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Printing => "Printing",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
