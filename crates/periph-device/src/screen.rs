//! Screen recording and screenshots through ffmpeg.
//!
//! Linux grabs from X11 (`x11grab`) using monitor geometry from
//! `xrandr --listmonitors`, macOS uses avfoundation's "Capture screen N"
//! inputs, and Windows grabs the whole desktop with `gdigrab`.

use async_trait::async_trait;
use chrono::Local;
use periph_config::CaptureConfig;
use periph_core::{Capability, Device, DeviceClass, PeriphError, Result};
use periph_session::{
    BackendHandle, BackendStatus, EventSink, HandleId, ScreenOptions, SessionBackend, StartParams,
    StartRequest,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::camera::{ensure_parent, ensure_written};
use crate::platform::{self, Platform};
use crate::process::{self, ProcessSupervisor};

const CAPTURE_LIMIT: Duration = Duration::from_secs(30);
const LIST_LIMIT: Duration = Duration::from_secs(10);
const MAX_FPS: u32 = 60;

/// A capture rectangle, relative to the monitor's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl Region {
    /// Parse `WxH+X+Y` or `WxH`.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || PeriphError::InvalidArgument {
            tool: "record_screen".into(),
            reason: format!("region '{raw}' is not WxH+X+Y"),
        };
        let mut parts = raw.trim().split('+');
        let size = parts.next().ok_or_else(invalid)?;
        let (w, h) = size.split_once('x').ok_or_else(invalid)?;
        let width: u32 = w.parse().map_err(|_| invalid())?;
        let height: u32 = h.parse().map_err(|_| invalid())?;
        let x: u32 = parts.next().map_or(Ok(0), str::parse::<u32>).map_err(|_| invalid())?;
        let y: u32 = parts.next().map_or(Ok(0), str::parse::<u32>).map_err(|_| invalid())?;
        if parts.next().is_some() || width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height, x, y })
    }

    /// libx264 with yuv420p needs even dimensions.
    fn even(self) -> Self {
        Self {
            width: (self.width & !1).max(2),
            height: (self.height & !1).max(2),
            ..self
        }
    }
}

/// One monitor as reported by `xrandr --listmonitors`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub index: u32,
    pub name: String,
    pub primary: bool,
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

pub struct ScreenBackend {
    ffmpeg: ProcessSupervisor,
    capture: CaptureConfig,
    platform: Platform,
}

impl ScreenBackend {
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

    fn screen_options<'a>(&self, params: &'a StartParams) -> Result<&'a ScreenOptions> {
        match params {
            StartParams::Screen(opts) => Ok(opts),
            other => Err(PeriphError::InvalidArgument {
                tool: "screen".into(),
                reason: format!("screen cannot run a {} session", other.kind()),
            }),
        }
    }

    fn default_fps(&self) -> u32 {
        (self.capture.default_fps.round() as u32).clamp(1, MAX_FPS)
    }

    async fn list_x11(&self) -> Vec<Device> {
        let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into());
        let monitors = match process::run_command("xrandr", &["--listmonitors".into()], LIST_LIMIT).await {
            Ok(out) => parse_xrandr_monitors(&out),
            Err(e) => {
                debug!(error = %e, "xrandr unavailable, assuming a single display");
                Vec::new()
            }
        };
        if monitors.is_empty() {
            return vec![display_device(0, "Default display", true).with_detail("x11_display", display)];
        }
        monitors
            .into_iter()
            .map(|m| {
                display_device(m.index, &m.name, m.primary)
                    .with_detail("x11_display", display.clone())
                    .with_detail("resolution", format!("{}x{}", m.width, m.height))
                    .with_detail("offset_x", m.x)
                    .with_detail("offset_y", m.y)
            })
            .collect()
    }

    async fn list_avfoundation(&self) -> Result<Vec<Device>> {
        let stderr = process::run_for_stderr(
            self.ffmpeg.program(),
            &["-hide_banner", "-f", "avfoundation", "-list_devices", "true", "-i", ""]
                .map(String::from),
            LIST_LIMIT,
        )
        .await?;
        Ok(platform::parse_avfoundation_devices(&stderr)
            .video
            .into_iter()
            .filter_map(|(input, name)| {
                let n: u32 = name.strip_prefix("Capture screen ")?.trim().parse().ok()?;
                Some(display_device(n, &name, n == 0).with_detail("input", input.to_string()))
            })
            .collect())
    }
}

#[async_trait]
impl SessionBackend for ScreenBackend {
    fn class(&self) -> DeviceClass {
        DeviceClass::Screen
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        match self.platform {
            Platform::Linux => Ok(self.list_x11().await),
            Platform::MacOs => self.list_avfoundation().await,
            Platform::Windows => Ok(vec![
                display_device(0, "Desktop", true).with_detail("input", "desktop"),
            ]),
            Platform::Other => Ok(Vec::new()),
        }
    }

    fn prepare(&self, device: &Device, params: &StartParams) -> Result<PathBuf> {
        let opts = self.screen_options(params)?;
        let output = platform::resolve_output(
            opts.save_path.as_deref(),
            &self.capture.resolved_output_dir(),
            "screen_recording",
            "mp4",
            Local::now(),
        );
        recording_args(self.platform, device, opts, self.default_fps(), &output)?;
        Ok(output)
    }

    async fn start(&self, request: StartRequest, sink: EventSink) -> Result<BackendHandle> {
        let opts = self.screen_options(&request.params)?;
        let args = recording_args(
            self.platform,
            &request.device,
            opts,
            self.default_fps(),
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
            audio = opts.audio,
            "screen recording started"
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
            "screenshot",
            "png",
            Local::now(),
        );
        ensure_parent(&output).await?;
        let args = screenshot_args(self.platform, device, &output)?;
        process::run_command(self.ffmpeg.program(), &args, CAPTURE_LIMIT).await?;
        ensure_written(&output).await?;
        info!(device = %device.id, output = %output.display(), "screenshot captured");
        Ok(output)
    }
}

// ─── Argument builders ──────────────────────────────────────────

pub fn recording_args(
    platform: Platform,
    device: &Device,
    opts: &ScreenOptions,
    default_fps: u32,
    output: &Path,
) -> Result<Vec<String>> {
    let fps = opts.fps.unwrap_or(default_fps);
    if fps == 0 || fps > MAX_FPS {
        return Err(PeriphError::InvalidArgument {
            tool: "record_screen".into(),
            reason: format!("fps must be between 1 and {MAX_FPS}, got {fps}"),
        });
    }
    if opts.duration_secs == Some(0) {
        return Err(PeriphError::InvalidArgument {
            tool: "record_screen".into(),
            reason: "duration must be at least 1 second".into(),
        });
    }
    if opts.audio && !matches!(platform, Platform::Linux | Platform::MacOs) {
        return Err(PeriphError::backend(format!(
            "screen recording with audio is not supported on {platform:?}"
        )));
    }
    let region = opts.region.as_deref().map(Region::parse).transpose()?.map(Region::even);

    let mut args = vec!["-hide_banner".into(), "-loglevel".into(), "error".into(), "-y".into()];
    args.extend(grab_input(platform, device, Some(fps), region, opts.audio)?);
    if let (Some(r), Platform::MacOs) = (region, platform) {
        args.push("-vf".into());
        args.push(format!("crop={}:{}:{}:{}", r.width, r.height, r.x, r.y));
    }
    let preset = if opts.duration_secs.is_some() { "fast" } else { "superfast" };
    args.extend(
        ["-vcodec", "libx264", "-pix_fmt", "yuv420p", "-crf", "23", "-preset", preset]
            .map(String::from),
    );
    if opts.audio {
        args.extend(["-c:a", "aac"].map(String::from));
    }
    if let Some(secs) = opts.duration_secs {
        args.push("-t".into());
        args.push(secs.to_string());
    }
    args.push(output.display().to_string());
    Ok(args)
}

pub fn screenshot_args(platform: Platform, device: &Device, output: &Path) -> Result<Vec<String>> {
    let mut args = vec!["-hide_banner".into(), "-loglevel".into(), "error".into(), "-y".into()];
    args.extend(grab_input(platform, device, None, None, false)?);
    args.extend(["-frames:v", "1"].map(String::from));
    args.push(output.display().to_string());
    Ok(args)
}

fn grab_input(
    platform: Platform,
    device: &Device,
    fps: Option<u32>,
    region: Option<Region>,
    audio: bool,
) -> Result<Vec<String>> {
    let mut args: Vec<String> = Vec::new();
    let rate = |args: &mut Vec<String>| {
        if let Some(fps) = fps {
            args.push("-framerate".into());
            args.push(fps.to_string());
        }
    };
    match platform {
        Platform::Linux => {
            let display = detail_str(device, "x11_display").unwrap_or(":0");
            let base_x = detail_u32(device, "offset_x");
            let base_y = detail_u32(device, "offset_y");
            args.extend(["-f", "x11grab"].map(String::from));
            rate(&mut args);
            let (x, y) = match region {
                Some(r) => {
                    args.push("-video_size".into());
                    args.push(format!("{}x{}", r.width, r.height));
                    (base_x + r.x, base_y + r.y)
                }
                None => {
                    if let Some(size) = detail_str(device, "resolution") {
                        args.push("-video_size".into());
                        args.push(size.to_string());
                    }
                    (base_x, base_y)
                }
            };
            args.push("-i".into());
            args.push(format!("{display}+{x},{y}"));
            if audio {
                args.extend(["-f", "pulse", "-i", "default"].map(String::from));
            }
        }
        Platform::MacOs => {
            let input = detail_str(device, "input").unwrap_or("1");
            args.extend(["-f", "avfoundation", "-capture_cursor", "1"].map(String::from));
            rate(&mut args);
            args.push("-i".into());
            args.push(if audio {
                format!("{input}:default")
            } else {
                input.to_string()
            });
        }
        Platform::Windows => {
            args.extend(["-f", "gdigrab"].map(String::from));
            rate(&mut args);
            if let Some(r) = region {
                args.extend([
                    "-offset_x".into(),
                    r.x.to_string(),
                    "-offset_y".into(),
                    r.y.to_string(),
                    "-video_size".into(),
                    format!("{}x{}", r.width, r.height),
                ]);
            }
            args.extend(["-i", "desktop"].map(String::from));
        }
        Platform::Other => {
            return Err(PeriphError::backend(
                "screen capture is not supported on this platform",
            ));
        }
    }
    Ok(args)
}

fn detail_str<'a>(device: &'a Device, key: &str) -> Option<&'a str> {
    device.details.get(key).and_then(|v| v.as_str())
}

fn detail_u32(device: &Device, key: &str) -> u32 {
    device
        .details
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

// ─── Enumeration helpers ────────────────────────────────────────

fn display_device(index: u32, name: &str, primary: bool) -> Device {
    Device::new(format!("display{index}"), DeviceClass::Screen, name)
        .with_capability(Capability::Video)
        .with_capability(Capability::Still)
        .with_detail("is_primary", primary)
}

/// Parse `xrandr --listmonitors`:
///
/// ```text
/// Monitors: 2
///  0: +*eDP-1 2560/344x1600/215+0+0  eDP-1
///  1: +HDMI-1 3840/600x2160/340+2560+0  HDMI-1
/// ```
pub fn parse_xrandr_monitors(output: &str) -> Vec<Monitor> {
    output
        .lines()
        .filter_map(|line| {
            let (index, rest) = line.trim().split_once(':')?;
            let index: u32 = index.trim().parse().ok()?;
            let mut fields = rest.split_whitespace();
            let flagged = fields.next()?;
            let geometry = fields.next()?;
            let name = flagged.trim_start_matches(['+', '*']).to_string();
            let primary = flagged.contains('*');

            // 2560/344x1600/215+0+0
            let (size, offsets) = geometry.split_once('+')?;
            let (w, h) = size.split_once('x')?;
            let width = w.split('/').next()?.parse().ok()?;
            let height = h.split('/').next()?.parse().ok()?;
            let (x, y) = offsets.split_once('+')?;
            Some(Monitor {
                index,
                name,
                primary,
                width,
                height,
                x: x.parse().ok()?,
                y: y.parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const XRANDR: &str = "\
Monitors: 2
 0: +*eDP-1 2560/344x1600/215+0+0  eDP-1
 1: +HDMI-1 3840/600x2160/340+2560+0  HDMI-1
";

    fn hdmi() -> Device {
        let m = &parse_xrandr_monitors(XRANDR)[1];
        display_device(m.index, &m.name, m.primary)
            .with_detail("x11_display", ":1")
            .with_detail("resolution", format!("{}x{}", m.width, m.height))
            .with_detail("offset_x", m.x)
            .with_detail("offset_y", m.y)
    }

    #[test]
    fn test_parse_xrandr_monitors() {
        let monitors = parse_xrandr_monitors(XRANDR);
        assert_eq!(monitors.len(), 2);
        assert_eq!(
            monitors[0],
            Monitor {
                index: 0,
                name: "eDP-1".into(),
                primary: true,
                width: 2560,
                height: 1600,
                x: 0,
                y: 0,
            }
        );
        assert!(!monitors[1].primary);
        assert_eq!(monitors[1].x, 2560);
    }

    #[test]
    fn test_region_parse() {
        assert_eq!(
            Region::parse("1280x720+10+20").unwrap(),
            Region { width: 1280, height: 720, x: 10, y: 20 }
        );
        assert_eq!(Region::parse("800x600").unwrap().x, 0);
        for bad in ["", "1280", "0x720", "axb+1+2", "10x10+1+2+3"] {
            assert!(Region::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_x11_args_offset_by_monitor() {
        let opts = ScreenOptions {
            region: Some("641x480+10+20".into()),
            ..Default::default()
        };
        let args = recording_args(Platform::Linux, &hdmi(), &opts, 30, Path::new("/tmp/s.mp4")).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-f x11grab -framerate 30 -video_size 640x480 -i :1+2570,20"));
        assert!(joined.contains("-preset superfast"));
    }

    #[test]
    fn test_x11_full_monitor_with_audio() {
        let opts = ScreenOptions {
            audio: true,
            duration_secs: Some(60),
            ..Default::default()
        };
        let args = recording_args(Platform::Linux, &hdmi(), &opts, 30, Path::new("/tmp/s.mp4")).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-video_size 3840x2160 -i :1+2560,0 -f pulse -i default"));
        assert!(joined.contains("-c:a aac -t 60 /tmp/s.mp4"));
    }

    #[test]
    fn test_macos_region_uses_crop() {
        let device = display_device(0, "Capture screen 0", true).with_detail("input", "2");
        let opts = ScreenOptions {
            region: Some("100x100+5+5".into()),
            audio: true,
            ..Default::default()
        };
        let joined = recording_args(Platform::MacOs, &device, &opts, 30, Path::new("/o.mp4"))
            .unwrap()
            .join(" ");
        assert!(joined.contains("-i 2:default"));
        assert!(joined.contains("-vf crop=100:100:5:5"));
    }

    #[test]
    fn test_windows_audio_rejected_and_fps_bounds() {
        let device = display_device(0, "Desktop", true);
        let opts = ScreenOptions {
            audio: true,
            ..Default::default()
        };
        assert_eq!(
            recording_args(Platform::Windows, &device, &opts, 30, Path::new("/o.mp4"))
                .unwrap_err()
                .kind(),
            "backend_error"
        );
        let opts = ScreenOptions {
            fps: Some(120),
            ..Default::default()
        };
        assert_eq!(
            recording_args(Platform::Windows, &device, &opts, 30, Path::new("/o.mp4"))
                .unwrap_err()
                .kind(),
            "invalid_argument"
        );
    }

    #[test]
    fn test_screenshot_args() {
        let joined = screenshot_args(Platform::Windows, &display_device(0, "Desktop", true), Path::new("/s.png"))
            .unwrap()
            .join(" ");
        assert!(joined.ends_with("-f gdigrab -i desktop -frames:v 1 /s.png"));
    }
}
