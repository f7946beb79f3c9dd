//! Camera recording and still capture through ffmpeg.
//!
//! Inputs per platform:
//! - Linux: v4l2 on `/dev/videoN`
//! - macOS: avfoundation by device index
//! - Windows: dshow by device name
//!
//! # Requirements
//!
//! ffmpeg must be installed and on PATH (or configured via `capture.ffmpeg_path`).

use async_trait::async_trait;
use chrono::Local;
use periph_config::CaptureConfig;
use periph_core::{Capability, Device, DeviceClass, PeriphError, Result};
use periph_session::{
    BackendHandle, BackendStatus, EventSink, HandleId, SessionBackend, StartParams, StartRequest,
    VideoOptions,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::platform::{self, Platform};
use crate::process::{self, ProcessSupervisor, strings};

/// avfoundation rejects higher rates on most built-in cameras.
const MACOS_MAX_FPS: f64 = 30.0;

const CAPTURE_LIMIT: Duration = Duration::from_secs(30);
const LIST_LIMIT: Duration = Duration::from_secs(10);

pub struct CameraBackend {
    ffmpeg: ProcessSupervisor,
    capture: CaptureConfig,
    platform: Platform,
}

impl CameraBackend {
    pub fn new(capture: CaptureConfig) -> Self {
        Self {
            ffmpeg: ProcessSupervisor::new(capture.ffmpeg_path.clone(), capture.stop_grace()),
            capture,
            platform: Platform::current(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    fn video_options<'a>(&self, params: &'a StartParams) -> Result<&'a VideoOptions> {
        match params {
            StartParams::Video(opts) => Ok(opts),
            other => Err(PeriphError::InvalidArgument {
                tool: "camera".into(),
                reason: format!("camera cannot run a {} session", other.kind()),
            }),
        }
    }

    fn recording_target(&self, opts: &VideoOptions) -> PathBuf {
        platform::resolve_output(
            opts.save_path.as_deref(),
            &self.capture.resolved_output_dir(),
            "camera_recording",
            "mp4",
            Local::now(),
        )
    }

    async fn list_linux(&self) -> Result<Vec<Device>> {
        let mut nodes = Vec::new();
        let mut entries = match tokio::fs::read_dir("/dev").await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "cannot read /dev");
                return Ok(Vec::new());
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = entry.file_name().to_str().and_then(parse_video_node) {
                nodes.push(n);
            }
        }
        nodes.sort_unstable();

        let mut devices = Vec::new();
        for n in nodes {
            let sys = PathBuf::from(format!("/sys/class/video4linux/video{n}"));
            // Non-zero index marks a metadata node of the same camera.
            if let Ok(index) = tokio::fs::read_to_string(sys.join("index")).await
                && index.trim() != "0"
            {
                continue;
            }
            let name = tokio::fs::read_to_string(sys.join("name"))
                .await
                .ok()
                .map(|s| s.trim().to_string());
            devices.push(linux_camera(n, name));
        }
        Ok(devices)
    }

    async fn list_from_ffmpeg(&self) -> Result<Vec<Device>> {
        let program = self.ffmpeg.program();
        let devices = match self.platform {
            Platform::MacOs => {
                let stderr = process::run_for_stderr(
                    program,
                    &strings(&["-hide_banner", "-f", "avfoundation", "-list_devices", "true", "-i", ""]),
                    LIST_LIMIT,
                )
                .await?;
                platform::parse_avfoundation_devices(&stderr)
                    .video
                    .into_iter()
                    .filter(|(_, name)| !name.starts_with("Capture screen"))
                    .map(|(index, name)| {
                        camera_device(index, &name).with_detail("input", index.to_string())
                    })
                    .collect()
            }
            Platform::Windows => {
                let stderr = process::run_for_stderr(
                    program,
                    &strings(&["-hide_banner", "-list_devices", "true", "-f", "dshow", "-i", "dummy"]),
                    LIST_LIMIT,
                )
                .await?;
                platform::parse_dshow_devices(&stderr)
                    .video
                    .into_iter()
                    .map(|(index, name)| {
                        let input = format!("video={name}");
                        camera_device(index, &name).with_detail("input", input)
                    })
                    .collect()
            }
            Platform::Linux | Platform::Other => Vec::new(),
        };
        Ok(devices)
    }
}

#[async_trait]
impl SessionBackend for CameraBackend {
    fn class(&self) -> DeviceClass {
        DeviceClass::Camera
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        match self.platform {
            Platform::Linux => self.list_linux().await,
            Platform::MacOs | Platform::Windows => self.list_from_ffmpeg().await,
            Platform::Other => Ok(Vec::new()),
        }
    }

    fn prepare(&self, device: &Device, params: &StartParams) -> Result<PathBuf> {
        let opts = self.video_options(params)?;
        let output = self.recording_target(opts);
        recording_args(self.platform, device, opts, self.capture.default_fps, &output)?;
        Ok(output)
    }

    async fn start(&self, request: StartRequest, sink: EventSink) -> Result<BackendHandle> {
        let opts = self.video_options(&request.params)?;
        let args = recording_args(
            self.platform,
            &request.device,
            opts,
            self.capture.default_fps,
            &request.output,
        )?;
        ensure_parent(&request.output).await?;

        let handle = self
            .ffmpeg
            .spawn(
                &format!("ffmpeg:{}", request.device.id),
                &args,
                request.session_id,
                sink,
                Some(request.output.clone()),
            )
            .await?;
        info!(
            session.id = %request.session_id,
            device = %request.device.id,
            output = %request.output.display(),
            "camera recording started"
        );
        Ok(handle)
    }

    async fn stop(&self, handle: BackendHandle) -> Result<()> {
        self.ffmpeg.stop_checked(handle).await
    }

    async fn poll(&self, handle: HandleId) -> Result<BackendStatus> {
        Ok(self.ffmpeg.poll(handle))
    }

    async fn capture(&self, device: &Device, target: Option<PathBuf>) -> Result<PathBuf> {
        let output = platform::resolve_output(
            target.as_deref(),
            &self.capture.resolved_output_dir(),
            "camera_capture",
            "jpg",
            Local::now(),
        );
        ensure_parent(&output).await?;
        let args = still_args(self.platform, device, self.capture.default_fps, &output);
        process::run_command(self.ffmpeg.program(), &args, CAPTURE_LIMIT).await?;
        ensure_written(&output).await?;
        info!(device = %device.id, output = %output.display(), "photo captured");
        Ok(output)
    }
}

// ─── Argument builders ──────────────────────────────────────────

/// ffmpeg arguments for a camera recording into `output`.
pub fn recording_args(
    platform: Platform,
    device: &Device,
    opts: &VideoOptions,
    default_fps: f64,
    output: &Path,
) -> Result<Vec<String>> {
    let fps = opts.fps.unwrap_or(default_fps);
    if !fps.is_finite() || fps <= 0.0 {
        return Err(PeriphError::InvalidArgument {
            tool: "start_video_recording".into(),
            reason: format!("fps must be positive, got {fps}"),
        });
    }
    if platform == Platform::MacOs && fps > MACOS_MAX_FPS {
        return Err(PeriphError::InvalidArgument {
            tool: "start_video_recording".into(),
            reason: format!("fps {fps} exceeds the {MACOS_MAX_FPS} supported on macOS"),
        });
    }
    if opts.duration_secs == Some(0) {
        return Err(PeriphError::InvalidArgument {
            tool: "start_video_recording".into(),
            reason: "duration must be at least 1 second".into(),
        });
    }

    let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y"]);
    args.extend(input_args(platform, device, Some(fps)));
    let preset = if opts.duration_secs.is_some() { "fast" } else { "superfast" };
    args.extend(strings(&[
        "-vcodec", "libx264", "-pix_fmt", "yuv420p", "-crf", "23", "-preset", preset,
    ]));
    if let Some(secs) = opts.duration_secs {
        args.push("-t".into());
        args.push(secs.to_string());
    }
    args.push(output.display().to_string());
    Ok(args)
}

/// ffmpeg arguments for grabbing a single frame into `output`.
pub fn still_args(platform: Platform, device: &Device, default_fps: f64, output: &Path) -> Vec<String> {
    let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y"]);
    // avfoundation refuses to open without an explicit rate.
    let fps = (platform == Platform::MacOs).then_some(default_fps.min(MACOS_MAX_FPS));
    args.extend(input_args(platform, device, fps));
    args.extend(strings(&["-frames:v", "1"]));
    args.push(output.display().to_string());
    args
}

fn input_args(platform: Platform, device: &Device, fps: Option<f64>) -> Vec<String> {
    let mut args = Vec::new();
    match platform {
        Platform::Linux => args.extend(strings(&["-f", "v4l2"])),
        Platform::MacOs => args.extend(strings(&["-f", "avfoundation"])),
        Platform::Windows => args.extend(strings(&["-f", "dshow"])),
        Platform::Other => {}
    }
    if let Some(fps) = fps {
        args.push("-framerate".into());
        args.push(fps.to_string());
    }
    if platform == Platform::MacOs {
        args.extend(strings(&["-pixel_format", "uyvy422"]));
    }
    args.push("-i".into());
    args.push(device_input(platform, device));
    args
}

/// The `-i` value for a device: the enumerated input when known, otherwise
/// derived from the `camN` id.
fn device_input(platform: Platform, device: &Device) -> String {
    if let Some(input) = device.details.get("input").and_then(|v| v.as_str()) {
        return input.to_string();
    }
    let index = device.id.trim_start_matches("cam");
    match platform {
        Platform::Linux => format!("/dev/video{index}"),
        Platform::Windows => format!("video={}", device.name),
        Platform::MacOs | Platform::Other => index.to_string(),
    }
}

// ─── Enumeration helpers ────────────────────────────────────────

/// `video3` → 3.
fn parse_video_node(name: &str) -> Option<u32> {
    name.strip_prefix("video")?.parse().ok()
}

fn camera_device(index: u32, name: &str) -> Device {
    Device::new(format!("cam{index}"), DeviceClass::Camera, name)
        .with_capability(Capability::Video)
        .with_capability(Capability::Still)
}

fn linux_camera(n: u32, sys_name: Option<String>) -> Device {
    let path = format!("/dev/video{n}");
    let name = sys_name
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("Video device {n}"));
    camera_device(n, &name)
        .with_detail("path", path.clone())
        .with_detail("input", path)
}


pub(crate) async fn ensure_parent(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// A one-shot capture counts only if it produced a non-empty file.
pub(crate) async fn ensure_written(output: &Path) -> Result<()> {
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(PeriphError::backend(format!(
            "no valid file was created at {}",
            output.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cam0() -> Device {
        linux_camera(0, Some("Integrated Webcam".into()))
    }

    #[test]
    fn test_parse_video_node() {
        assert_eq!(parse_video_node("video0"), Some(0));
        assert_eq!(parse_video_node("video12"), Some(12));
        assert_eq!(parse_video_node("vhci"), None);
        assert_eq!(parse_video_node("video"), None);
    }

    #[test]
    fn test_linux_camera_device() {
        let dev = cam0();
        assert_eq!(dev.id, "cam0");
        assert_eq!(dev.name, "Integrated Webcam");
        assert!(dev.supports(Capability::Video));
        assert!(dev.supports(Capability::Still));
        assert_eq!(dev.details["path"], "/dev/video0");

        assert_eq!(linux_camera(2, None).name, "Video device 2");
    }

    #[test]
    fn test_open_ended_recording_args() {
        let args = recording_args(
            Platform::Linux,
            &cam0(),
            &VideoOptions::default(),
            30.0,
            Path::new("/tmp/out.mp4"),
        )
        .unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-f v4l2 -framerate 30 -i /dev/video0"));
        assert!(joined.contains("-vcodec libx264 -pix_fmt yuv420p -crf 23 -preset superfast"));
        assert!(!args.contains(&"-t".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/out.mp4");
    }

    #[test]
    fn test_fixed_duration_recording_args() {
        let opts = VideoOptions {
            fps: Some(15.0),
            duration_secs: Some(10),
            save_path: None,
        };
        let args =
            recording_args(Platform::Linux, &cam0(), &opts, 30.0, Path::new("/tmp/o.mp4")).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-framerate 15"));
        assert!(joined.contains("-preset fast -t 10 /tmp/o.mp4"));
    }

    #[test]
    fn test_macos_args_use_index_and_pixel_format() {
        let dev = camera_device(1, "FaceTime HD Camera").with_detail("input", "1");
        let args = recording_args(
            Platform::MacOs,
            &dev,
            &VideoOptions::default(),
            30.0,
            Path::new("/tmp/o.mp4"),
        )
        .unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-f avfoundation -framerate 30 -pixel_format uyvy422 -i 1"));
    }

    #[test]
    fn test_invalid_fps_rejected() {
        let opts = VideoOptions {
            fps: Some(0.0),
            ..Default::default()
        };
        let err = recording_args(Platform::Linux, &cam0(), &opts, 30.0, Path::new("/tmp/o.mp4"))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let opts = VideoOptions {
            fps: Some(60.0),
            ..Default::default()
        };
        assert!(recording_args(Platform::MacOs, &cam0(), &opts, 30.0, Path::new("/o.mp4")).is_err());
        assert!(recording_args(Platform::Linux, &cam0(), &opts, 30.0, Path::new("/o.mp4")).is_ok());
    }

    #[test]
    fn test_windows_input_falls_back_to_name() {
        let dev = camera_device(0, "USB Webcam");
        assert_eq!(device_input(Platform::Windows, &dev), "video=USB Webcam");
        assert_eq!(device_input(Platform::Linux, &dev), "/dev/video0");
    }

    #[test]
    fn test_still_args_grab_one_frame() {
        let args = still_args(Platform::Linux, &cam0(), 30.0, Path::new("/tmp/p.jpg"));
        let joined = args.join(" ");
        assert!(joined.contains("-i /dev/video0 -frames:v 1 /tmp/p.jpg"));
        assert!(!joined.contains("-framerate"));
    }

    #[test]
    fn test_prepare_rejects_other_params() {
        let backend = CameraBackend::new(CaptureConfig::default()).with_platform(Platform::Linux);
        let params = StartParams::Playback(periph_session::PlaybackOptions {
            file: PathBuf::from("/tmp/a.wav"),
        });
        assert_eq!(backend.prepare(&cam0(), &params).unwrap_err().kind(), "invalid_argument");

        let out = backend
            .prepare(&cam0(), &StartParams::Video(VideoOptions::default()))
            .unwrap();
        let name = out.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("camera_recording_") && name.ends_with(".mp4"));
    }
}
