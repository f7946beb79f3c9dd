//! Device tool definitions and executor.
//!
//! Exposes camera, audio, screen, printer and storage operations plus the
//! cross-class device management tools. Session tools go through the
//! [`SessionEngine`], print tools through the [`JobPoller`]. Tools of a
//! disabled device class are not advertised and fail with `FeatureDisabled`.

use async_trait::async_trait;
use chrono::Utc;
use periph_config::PeriphConfig;
use periph_core::{
    Capability, DeviceClass, PeriphError, SessionId, SessionKind, Tool, ToolCall, ToolExecutor,
    ToolResult,
};
use periph_session::{
    AudioRecordOptions, BackendSet, JobPoller, JobStatus, PlaybackOptions, PrintOptions,
    ScreenOptions, SessionEngine, SessionStatus, StartParams, VideoOptions,
};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Holds the session engine and job poller and dispatches tool calls.
pub struct DeviceTools {
    engine: Arc<SessionEngine>,
    jobs: Arc<JobPoller>,
}

impl DeviceTools {
    pub fn new(engine: Arc<SessionEngine>, jobs: Arc<JobPoller>) -> Self {
        Self { engine, jobs }
    }

    /// Engine and poller over the platform backends of every enabled class.
    pub fn from_config(config: PeriphConfig) -> Self {
        let backends = crate::build_backends(&config);
        Self::with_backends(config, backends)
    }

    /// Engine and poller over caller-supplied backends, sharing one event bus.
    pub fn with_backends(config: PeriphConfig, backends: BackendSet) -> Self {
        let printer = config.printer.clone();
        let engine = Arc::new(SessionEngine::new(config, backends));
        let jobs = Arc::new(JobPoller::new(
            engine.catalog().clone(),
            printer,
            engine.bus().clone(),
        ));
        Self { engine, jobs }
    }

    pub fn engine(&self) -> &Arc<SessionEngine> {
        &self.engine
    }

    pub fn jobs(&self) -> &Arc<JobPoller> {
        &self.jobs
    }

    /// Start the engine's event pump and sweep, and the print job poller.
    pub fn spawn_background(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.engine.spawn_background(token.clone())];
        if self.engine.catalog().is_enabled(DeviceClass::Printer) {
            handles.push(tokio::spawn(Arc::clone(&self.jobs).run(token)));
        }
        handles
    }

    /// Check if a tool name belongs to the device surface.
    pub fn has_tool(name: &str) -> bool {
        tool_class(name).is_some()
    }

    /// Every tool definition, regardless of which classes are enabled.
    pub fn definitions() -> Vec<Tool> {
        let mut tools = Vec::new();

        // ── Camera ────────────────────────────────────────────
        tools.push(Tool {
            name: "list_cameras".into(),
            description: "List all cameras connected to the system.".into(),
            parameters: json!({ "type": "object", "properties": {} }),
            class: Some(DeviceClass::Camera),
            is_mutating: false,
        });
        tools.push(Tool {
            name: "get_camera_info".into(),
            description: "Get detailed information about a camera, including any active recording.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "string", "description": "Camera id, e.g. \"cam0\"" }
                },
                "required": ["device_id"]
            }),
            class: Some(DeviceClass::Camera),
            is_mutating: false,
        });
        tools.push(Tool {
            name: "capture_image".into(),
            description: "Capture a still image from a camera. Returns the saved file path.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "string", "description": "Camera id" },
                    "save_path": { "type": "string", "description": "File or directory for the image (default: output dir)" }
                },
                "required": ["device_id"]
            }),
            class: Some(DeviceClass::Camera),
            is_mutating: true,
        });
        tools.push(Tool {
            name: "start_video_recording".into(),
            description: "Start recording video from a camera. Returns a session id; without a duration the recording runs until stopped.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "string", "description": "Camera id" },
                    "fps": { "type": "number", "description": "Frames per second (default from config)" },
                    "duration": { "type": "integer", "description": "Recording length in seconds (omit to record until stopped)" },
                    "save_path": { "type": "string", "description": "File or directory for the recording" }
                },
                "required": ["device_id"]
            }),
            class: Some(DeviceClass::Camera),
            is_mutating: true,
        });
        tools.push(Tool {
            name: "stop_video_recording".into(),
            description: "Stop a video recording and return its final status.".into(),
            parameters: session_id_schema(),
            class: Some(DeviceClass::Camera),
            is_mutating: true,
        });

        // ── Audio ─────────────────────────────────────────────
        tools.push(Tool {
            name: "list_audio_devices".into(),
            description: "List audio input and output devices.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "direction": { "type": "string", "enum": ["input", "output"], "description": "Only list inputs or outputs" }
                }
            }),
            class: Some(DeviceClass::Audio),
            is_mutating: false,
        });
        tools.push(Tool {
            name: "record_audio".into(),
            description: "Record audio from a microphone into a WAV file. Returns a session id.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "string", "description": "Input device id (default: \"default\")" },
                    "duration": { "type": "number", "description": "Recording length in seconds (omit to record until stopped)" },
                    "sample_rate": { "type": "integer", "description": "Sample rate in Hz (default: 44100)" },
                    "channels": { "type": "integer", "description": "Channel count (default: 1)" },
                    "output_file": { "type": "string", "description": "File or directory for the recording" }
                }
            }),
            class: Some(DeviceClass::Audio),
            is_mutating: true,
        });
        tools.push(Tool {
            name: "stop_audio_recording".into(),
            description: "Stop an audio recording and return its final status.".into(),
            parameters: session_id_schema(),
            class: Some(DeviceClass::Audio),
            is_mutating: true,
        });
        tools.push(Tool {
            name: "play_audio".into(),
            description: "Play an audio file through an output device. Returns a session id; the session completes when playback ends.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path to the audio file to play" },
                    "device_id": { "type": "string", "description": "Output device id (default: \"default\")" }
                },
                "required": ["file_path"]
            }),
            class: Some(DeviceClass::Audio),
            is_mutating: true,
        });
        tools.push(Tool {
            name: "stop_audio_playback".into(),
            description: "Stop audio playback and return its final status.".into(),
            parameters: session_id_schema(),
            class: Some(DeviceClass::Audio),
            is_mutating: true,
        });

        // ── Screen ────────────────────────────────────────────
        tools.push(Tool {
            name: "list_displays".into(),
            description: "List all displays connected to the system.".into(),
            parameters: json!({ "type": "object", "properties": {} }),
            class: Some(DeviceClass::Screen),
            is_mutating: false,
        });
        tools.push(Tool {
            name: "capture_screen".into(),
            description: "Capture a screenshot from a display. Returns the saved file path.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "string", "description": "Display id (default: \"display0\")" },
                    "save_path": { "type": "string", "description": "File or directory for the screenshot" }
                }
            }),
            class: Some(DeviceClass::Screen),
            is_mutating: true,
        });
        tools.push(Tool {
            name: "record_screen".into(),
            description: "Start recording a display. Returns a session id.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "string", "description": "Display id (default: \"display0\")" },
                    "save_path": { "type": "string", "description": "File or directory for the recording" },
                    "region": { "type": "string", "description": "Capture region as WxH+X+Y (default: full display)" },
                    "fps": { "type": "integer", "description": "Frames per second (default: 30)" },
                    "audio": { "type": "boolean", "description": "Also record the default audio input" },
                    "duration": { "type": "integer", "description": "Recording length in seconds (omit to record until stopped)" }
                }
            }),
            class: Some(DeviceClass::Screen),
            is_mutating: true,
        });
        tools.push(Tool {
            name: "stop_screen_recording".into(),
            description: "Stop a screen recording and return its final status.".into(),
            parameters: session_id_schema(),
            class: Some(DeviceClass::Screen),
            is_mutating: true,
        });

        // ── Printer ───────────────────────────────────────────
        tools.push(Tool {
            name: "list_printers".into(),
            description: "List all printers available on the system.".into(),
            parameters: json!({ "type": "object", "properties": {} }),
            class: Some(DeviceClass::Printer),
            is_mutating: false,
        });
        tools.push(Tool {
            name: "get_printer_status".into(),
            description: "Get a printer's details and the jobs queued on it.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "string", "description": "Printer id" }
                },
                "required": ["device_id"]
            }),
            class: Some(DeviceClass::Printer),
            is_mutating: false,
        });
        tools.push(Tool {
            name: "print_file".into(),
            description: "Print a file. Returns the spooler's job id.".into(),
            parameters: print_schema(),
            class: Some(DeviceClass::Printer),
            is_mutating: true,
        });
        tools.push(Tool {
            name: "print_as_pdf".into(),
            description: "Print a file, declaring it as a PDF document. Returns the spooler's job id.".into(),
            parameters: print_schema(),
            class: Some(DeviceClass::Printer),
            is_mutating: true,
        });
        tools.push(Tool {
            name: "get_print_job".into(),
            description: "Refresh a print job from the spooler and return its status.".into(),
            parameters: job_id_schema(),
            class: Some(DeviceClass::Printer),
            is_mutating: false,
        });
        tools.push(Tool {
            name: "cancel_print_job".into(),
            description: "Ask the spooler to cancel a print job.".into(),
            parameters: job_id_schema(),
            class: Some(DeviceClass::Printer),
            is_mutating: true,
        });

        // ── Storage ───────────────────────────────────────────
        tools.push(Tool {
            name: "list_storage_devices".into(),
            description: "List storage volumes.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "removable_only": { "type": "boolean", "description": "Only removable volumes" },
                    "mounted_only": { "type": "boolean", "description": "Only mounted volumes" }
                }
            }),
            class: Some(DeviceClass::Storage),
            is_mutating: false,
        });

        // ── Device management ─────────────────────────────────
        tools.push(Tool {
            name: "list_devices".into(),
            description: "List devices of every enabled class, or of one class.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "class": {
                        "type": "string",
                        "enum": ["camera", "audio", "screen", "printer", "storage"],
                        "description": "Only list this device class"
                    }
                }
            }),
            class: None,
            is_mutating: false,
        });
        tools.push(Tool {
            name: "get_device_info".into(),
            description: "Get a device by id, with its active session if any.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "string", "description": "Device id" }
                },
                "required": ["device_id"]
            }),
            class: None,
            is_mutating: false,
        });
        tools.push(Tool {
            name: "get_session_status".into(),
            description: "Get the status of a recording or playback session.".into(),
            parameters: session_id_schema(),
            class: None,
            is_mutating: false,
        });
        tools.push(Tool {
            name: "list_sessions".into(),
            description: "List tracked sessions, optionally for one device.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "string", "description": "Only sessions of this device" }
                }
            }),
            class: None,
            is_mutating: false,
        });
        tools.push(Tool {
            name: "cancel_session".into(),
            description: "Cancel a session that is starting or running. Cancelling a finished session has no effect.".into(),
            parameters: session_id_schema(),
            class: None,
            is_mutating: true,
        });

        tools
    }

    async fn dispatch(&self, call: &ToolCall) -> periph_core::Result<ToolResult> {
        match call.tool_name.as_str() {
            // ── Camera ────────────────────────────────────────
            "list_cameras" => self.list_class(call, DeviceClass::Camera).await,
            "get_camera_info" => {
                let device_id = require_str(call, "device_id")?;
                let device = self.engine.catalog().find(DeviceClass::Camera, device_id).await?;
                let active = self.engine.registry().active_session(&device.id);
                let content = match active {
                    Some(id) => format!("{} ({}) is recording, session {id}", device.name, device.id),
                    None => format!("{} ({}) is idle", device.name, device.id),
                };
                let mut data = serde_json::to_value(&device)?;
                data["active_session"] = json!(active.map(|id| id.to_string()));
                Ok(ToolResult::ok(call, content, Some(data)))
            }
            "capture_image" => {
                let device_id = require_str(call, "device_id")?;
                let path = self
                    .engine
                    .capture(DeviceClass::Camera, device_id, opt_path(call, "save_path"))
                    .await?;
                Ok(ToolResult::ok(
                    call,
                    format!("Image captured from {device_id}: {}", path.display()),
                    Some(json!({ "device_id": device_id, "file_path": path })),
                ))
            }
            "start_video_recording" => {
                let device_id = require_str(call, "device_id")?;
                let params = StartParams::Video(VideoOptions {
                    fps: opt_f64(call, "fps")?,
                    duration_secs: opt_u64(call, "duration")?,
                    save_path: opt_path(call, "save_path"),
                });
                self.start(call, device_id, params).await
            }
            "stop_video_recording" => self.stop(call, SessionKind::VideoRecording).await,

            // ── Audio ─────────────────────────────────────────
            "list_audio_devices" => {
                let wanted = match opt_str(call, "direction") {
                    None => None,
                    Some("input") => Some(Capability::AudioInput),
                    Some("output") => Some(Capability::AudioOutput),
                    Some(other) => {
                        return Err(invalid(call, format!("direction must be input or output, got '{other}'")));
                    }
                };
                let devices: Vec<_> = self
                    .engine
                    .catalog()
                    .list(DeviceClass::Audio)
                    .await?
                    .into_iter()
                    .filter(|d| wanted.is_none_or(|cap| d.supports(cap)))
                    .collect();
                Ok(device_list(call, "audio devices", devices))
            }
            "record_audio" => {
                let device_id = opt_str(call, "device_id").unwrap_or("default");
                let defaults = AudioRecordOptions::default();
                let params = StartParams::AudioRecord(AudioRecordOptions {
                    duration_secs: opt_f64(call, "duration")?,
                    sample_rate: opt_u64(call, "sample_rate")?
                        .map(|v| u32::try_from(v).map_err(|_| invalid(call, "sample_rate is too large")))
                        .transpose()?
                        .unwrap_or(defaults.sample_rate),
                    channels: opt_u64(call, "channels")?
                        .map(|v| u16::try_from(v).map_err(|_| invalid(call, "channels is too large")))
                        .transpose()?
                        .unwrap_or(defaults.channels),
                    output_file: opt_path(call, "output_file"),
                });
                self.start(call, device_id, params).await
            }
            "stop_audio_recording" => self.stop(call, SessionKind::AudioRecording).await,
            "play_audio" => {
                let file = PathBuf::from(require_str(call, "file_path")?);
                let device_id = opt_str(call, "device_id").unwrap_or("default");
                self.start(call, device_id, StartParams::Playback(PlaybackOptions { file }))
                    .await
            }
            "stop_audio_playback" => self.stop(call, SessionKind::AudioPlayback).await,

            // ── Screen ────────────────────────────────────────
            "list_displays" => self.list_class(call, DeviceClass::Screen).await,
            "capture_screen" => {
                let device_id = opt_str(call, "device_id").unwrap_or("display0");
                let path = self
                    .engine
                    .capture(DeviceClass::Screen, device_id, opt_path(call, "save_path"))
                    .await?;
                Ok(ToolResult::ok(
                    call,
                    format!("Screenshot of {device_id} saved to {}", path.display()),
                    Some(json!({ "device_id": device_id, "file_path": path })),
                ))
            }
            "record_screen" => {
                let device_id = opt_str(call, "device_id").unwrap_or("display0");
                let fps = opt_u64(call, "fps")?
                    .map(|v| u32::try_from(v).map_err(|_| invalid(call, "fps is too large")))
                    .transpose()?;
                let params = StartParams::Screen(ScreenOptions {
                    fps,
                    region: opt_str(call, "region").map(str::to_string),
                    audio: opt_bool(call, "audio").unwrap_or(false),
                    duration_secs: opt_u64(call, "duration")?,
                    save_path: opt_path(call, "save_path"),
                });
                self.start(call, device_id, params).await
            }
            "stop_screen_recording" => self.stop(call, SessionKind::ScreenRecording).await,

            // ── Printer ───────────────────────────────────────
            "list_printers" => self.list_class(call, DeviceClass::Printer).await,
            "get_printer_status" => {
                let device_id = require_str(call, "device_id")?;
                let status = self.jobs.printer_status(device_id).await?;
                Ok(ToolResult::ok(
                    call,
                    format!(
                        "{}: {} queued, {} printing",
                        status.printer.name, status.queued, status.printing
                    ),
                    Some(serde_json::to_value(&status)?),
                ))
            }
            "print_file" | "print_as_pdf" => {
                let device_id = require_str(call, "device_id")?;
                let file = PathBuf::from(require_str(call, "file_path")?);
                let defaults = PrintOptions::default();
                let options = PrintOptions {
                    copies: opt_u64(call, "copies")?
                        .map(|v| u32::try_from(v).map_err(|_| invalid(call, "copies is too large")))
                        .transpose()?
                        .unwrap_or(defaults.copies),
                    double_sided: opt_bool(call, "double_sided").unwrap_or(defaults.double_sided),
                    color: opt_bool(call, "color").unwrap_or(defaults.color),
                    format: defaults.format,
                };
                let job_id = if call.tool_name == "print_as_pdf" {
                    self.jobs.print_as_pdf(device_id, &file, options).await?
                } else {
                    self.jobs.submit(device_id, &file, options).await?
                };
                let job = self.jobs.get(&job_id)?;
                let status = JobStatus::from_job(&job, Utc::now());
                Ok(ToolResult::ok(
                    call,
                    format!("Submitted {} to {device_id} as job {job_id}", file.display()),
                    Some(serde_json::to_value(&status)?),
                ))
            }
            "get_print_job" => {
                let job_id = require_str(call, "job_id")?;
                let status = self.jobs.status(job_id).await?;
                Ok(ToolResult::ok(call, status.summary(), Some(serde_json::to_value(&status)?)))
            }
            "cancel_print_job" => {
                let job_id = require_str(call, "job_id")?;
                let job = self.jobs.cancel(job_id).await?;
                let status = JobStatus::from_job(&job, Utc::now());
                Ok(ToolResult::ok(call, status.summary(), Some(serde_json::to_value(&status)?)))
            }

            // ── Storage ───────────────────────────────────────
            "list_storage_devices" => {
                let removable_only = opt_bool(call, "removable_only").unwrap_or(false);
                let mounted_only = opt_bool(call, "mounted_only").unwrap_or(false);
                let devices: Vec<_> = self
                    .engine
                    .catalog()
                    .list(DeviceClass::Storage)
                    .await?
                    .into_iter()
                    .filter(|d| !removable_only || d.supports(Capability::Removable))
                    .filter(|d| {
                        !mounted_only || d.details.get("mount_point").is_some_and(|m| !m.is_null())
                    })
                    .collect();
                Ok(device_list(call, "storage volumes", devices))
            }

            // ── Device management ─────────────────────────────
            "list_devices" => match opt_str(call, "class") {
                None => {
                    let devices = self.engine.catalog().list_all().await;
                    Ok(device_list(call, "devices", devices))
                }
                Some(raw) => {
                    let class = parse_class(call, raw)?;
                    self.list_class(call, class).await
                }
            },
            "get_device_info" => {
                let device_id = require_str(call, "device_id")?;
                let device = self.engine.catalog().find_any(device_id).await?;
                let active = self.engine.registry().active_session(&device.id);
                let mut data = serde_json::to_value(&device)?;
                data["active_session"] = json!(active.map(|id| id.to_string()));
                Ok(ToolResult::ok(
                    call,
                    format!("{} ({}, {})", device.name, device.id, device.class),
                    Some(data),
                ))
            }
            "get_session_status" => {
                let id = parse_session_id(call)?;
                let status = self.engine.status(id)?;
                Ok(session_result(call, &status))
            }
            "list_sessions" => {
                let sessions = self.engine.list_sessions(opt_str(call, "device_id"));
                let content = if sessions.is_empty() {
                    "No sessions".to_string()
                } else {
                    sessions
                        .iter()
                        .map(SessionStatus::summary)
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                Ok(ToolResult::ok(call, content, Some(serde_json::to_value(&sessions)?)))
            }
            "cancel_session" => {
                let id = parse_session_id(call)?;
                let session = self.engine.cancel_session(id).await?;
                Ok(session_result(call, &SessionStatus::from_session(&session, Utc::now())))
            }

            other => Err(PeriphError::ToolNotFound(other.to_string())),
        }
    }

    async fn list_class(&self, call: &ToolCall, class: DeviceClass) -> periph_core::Result<ToolResult> {
        let devices = self.engine.catalog().list(class).await?;
        let label = match class {
            DeviceClass::Camera => "cameras",
            DeviceClass::Audio => "audio devices",
            DeviceClass::Screen => "displays",
            DeviceClass::Printer => "printers",
            DeviceClass::Storage => "storage volumes",
        };
        Ok(device_list(call, label, devices))
    }

    async fn start(
        &self,
        call: &ToolCall,
        device_id: &str,
        params: StartParams,
    ) -> periph_core::Result<ToolResult> {
        let id = self.engine.start_session(device_id, params).await?;
        let status = self.engine.status(id)?;
        Ok(session_result(call, &status))
    }

    /// Stop a session, rejecting ids that belong to another kind of session.
    async fn stop(&self, call: &ToolCall, kind: SessionKind) -> periph_core::Result<ToolResult> {
        let id = parse_session_id(call)?;
        let session = self.engine.registry().get(id)?;
        if session.kind != kind {
            return Err(PeriphError::NotFound {
                entity: kind_entity(kind),
                id: id.to_string(),
            });
        }
        let session = self.engine.stop_session(id).await?;
        Ok(session_result(call, &SessionStatus::from_session(&session, Utc::now())))
    }
}

#[async_trait]
impl ToolExecutor for DeviceTools {
    /// Tools of enabled classes plus the cross-class management tools.
    fn tools(&self) -> Vec<Tool> {
        let catalog = self.engine.catalog();
        Self::definitions()
            .into_iter()
            .filter(|t| t.class.is_none_or(|c| catalog.is_enabled(c)))
            .collect()
    }

    async fn execute(&self, call: &ToolCall) -> periph_core::Result<ToolResult> {
        let Some(class) = tool_class(&call.tool_name) else {
            return Err(PeriphError::ToolNotFound(call.tool_name.clone()));
        };
        if let Some(class) = class
            && let Err(e) = self.engine.catalog().ensure_enabled(class)
        {
            debug!(tool = %call.tool_name, %class, "tool of disabled class called");
            return Ok(ToolResult::from_error(call, &e));
        }

        match self.dispatch(call).await {
            Ok(result) => Ok(result),
            Err(e @ PeriphError::ToolNotFound(_)) => Err(e),
            Err(e) => {
                warn!(tool = %call.tool_name, kind = e.kind(), error = %e, "tool call failed");
                Ok(ToolResult::from_error(call, &e))
            }
        }
    }
}

/// Class gating a tool: `Some(None)` for cross-class tools, `None` when the
/// name is not a device tool at all.
fn tool_class(name: &str) -> Option<Option<DeviceClass>> {
    let class = match name {
        "list_cameras" | "get_camera_info" | "capture_image" | "start_video_recording"
        | "stop_video_recording" => Some(DeviceClass::Camera),
        "list_audio_devices" | "record_audio" | "stop_audio_recording" | "play_audio"
        | "stop_audio_playback" => Some(DeviceClass::Audio),
        "list_displays" | "capture_screen" | "record_screen" | "stop_screen_recording" => {
            Some(DeviceClass::Screen)
        }
        "list_printers" | "get_printer_status" | "print_file" | "print_as_pdf" | "get_print_job"
        | "cancel_print_job" => Some(DeviceClass::Printer),
        "list_storage_devices" => Some(DeviceClass::Storage),
        "list_devices" | "get_device_info" | "get_session_status" | "list_sessions"
        | "cancel_session" => None,
        _ => return None,
    };
    Some(class)
}

fn kind_entity(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::VideoRecording => "video recording",
        SessionKind::AudioRecording => "audio recording",
        SessionKind::AudioPlayback => "audio playback",
        SessionKind::ScreenRecording => "screen recording",
    }
}

fn session_result(call: &ToolCall, status: &SessionStatus) -> ToolResult {
    ToolResult::ok(
        call,
        status.summary(),
        Some(serde_json::to_value(status).unwrap_or_default()),
    )
}

fn device_list(call: &ToolCall, label: &str, devices: Vec<periph_core::Device>) -> ToolResult {
    let content = if devices.is_empty() {
        format!("No {label} found")
    } else {
        let mut out = format!("{} {label}:\n", devices.len());
        for d in &devices {
            out.push_str(&format!("- {} ({})\n", d.id, d.name));
        }
        out
    };
    ToolResult::ok(call, content, Some(serde_json::to_value(&devices).unwrap_or_default()))
}

fn session_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_id": { "type": "string", "description": "Session id returned by the start call" }
        },
        "required": ["session_id"]
    })
}

fn job_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "job_id": { "type": "string", "description": "Job id returned by print_file" }
        },
        "required": ["job_id"]
    })
}

fn print_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "device_id": { "type": "string", "description": "Printer id" },
            "file_path": { "type": "string", "description": "Path to the file to print" },
            "copies": { "type": "integer", "description": "Number of copies (default: 1)" },
            "double_sided": { "type": "boolean", "description": "Print on both sides (default: false)" },
            "color": { "type": "boolean", "description": "Print in color (default: true)" }
        },
        "required": ["device_id", "file_path"]
    })
}

// ─── Argument helpers ───────────────────────────────────────────

fn invalid(call: &ToolCall, reason: impl Into<String>) -> PeriphError {
    PeriphError::InvalidArgument {
        tool: call.tool_name.clone(),
        reason: reason.into(),
    }
}

fn require_str<'a>(call: &'a ToolCall, key: &str) -> periph_core::Result<&'a str> {
    call.arguments[key]
        .as_str()
        .ok_or_else(|| invalid(call, format!("missing '{key}' argument")))
}

fn opt_str<'a>(call: &'a ToolCall, key: &str) -> Option<&'a str> {
    call.arguments[key].as_str().filter(|s| !s.is_empty())
}

fn opt_path(call: &ToolCall, key: &str) -> Option<PathBuf> {
    opt_str(call, key).map(PathBuf::from)
}

fn opt_bool(call: &ToolCall, key: &str) -> Option<bool> {
    call.arguments[key].as_bool()
}

fn opt_u64(call: &ToolCall, key: &str) -> periph_core::Result<Option<u64>> {
    match &call.arguments[key] {
        Value::Null => Ok(None),
        v => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(call, format!("'{key}' must be a non-negative integer"))),
    }
}

fn opt_f64(call: &ToolCall, key: &str) -> periph_core::Result<Option<f64>> {
    match &call.arguments[key] {
        Value::Null => Ok(None),
        v => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(call, format!("'{key}' must be a number"))),
    }
}

fn parse_session_id(call: &ToolCall) -> periph_core::Result<SessionId> {
    let raw = require_str(call, "session_id")?;
    raw.parse()
        .map_err(|_| invalid(call, format!("'{raw}' is not a session id")))
}

fn parse_class(call: &ToolCall, raw: &str) -> periph_core::Result<DeviceClass> {
    DeviceClass::ALL
        .into_iter()
        .find(|c| c.as_str() == raw)
        .ok_or_else(|| invalid(call, format!("unknown device class '{raw}'")))
}
