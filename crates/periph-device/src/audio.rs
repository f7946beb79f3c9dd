//! Microphone recording and audio playback through ffmpeg.
//!
//! Recording writes WAV. Playback paces the file in real time (`-re`) into
//! the platform output device, so a playback session runs as long as the
//! file does and completes on its own.

use async_trait::async_trait;
use chrono::Local;
use periph_config::CaptureConfig;
use periph_core::{Capability, Device, DeviceClass, PeriphError, Result};
use periph_session::{
    AudioRecordOptions, BackendHandle, BackendStatus, EventSink, HandleId, PlaybackOptions,
    SessionBackend, StartParams, StartRequest,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::camera::ensure_parent;
use crate::platform::{self, Platform};
use crate::process::{self, ProcessSupervisor, strings};

const LIST_LIMIT: Duration = Duration::from_secs(10);
const SAMPLE_RATES: std::ops::RangeInclusive<u32> = 8_000..=192_000;
const MAX_CHANNELS: u16 = 8;

pub struct AudioBackend {
    ffmpeg: ProcessSupervisor,
    capture: CaptureConfig,
    platform: Platform,
}

impl AudioBackend {
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

    async fn list_alsa(&self) -> Result<Vec<Device>> {
        let mut devices = vec![default_device(self.platform)];
        match tokio::fs::read_to_string("/proc/asound/pcm").await {
            Ok(pcm) => devices.extend(parse_asound_pcm(&pcm)),
            Err(e) => debug!(error = %e, "cannot read /proc/asound/pcm"),
        }
        Ok(devices)
    }

    async fn list_from_ffmpeg(&self) -> Result<Vec<Device>> {
        let program = self.ffmpeg.program();
        let mut devices = vec![default_device(self.platform)];
        match self.platform {
            Platform::MacOs => {
                let stderr = process::run_for_stderr(
                    program,
                    &strings(&["-hide_banner", "-f", "avfoundation", "-list_devices", "true", "-i", ""]),
                    LIST_LIMIT,
                )
                .await?;
                for (index, name) in platform::parse_avfoundation_devices(&stderr).audio {
                    devices.push(
                        Device::new(format!("audio{index}"), DeviceClass::Audio, name)
                            .with_capability(Capability::AudioInput)
                            .with_detail("input", format!(":{index}")),
                    );
                }
            }
            Platform::Windows => {
                let stderr = process::run_for_stderr(
                    program,
                    &strings(&["-hide_banner", "-list_devices", "true", "-f", "dshow", "-i", "dummy"]),
                    LIST_LIMIT,
                )
                .await?;
                for (index, name) in platform::parse_dshow_devices(&stderr).audio {
                    let input = format!("audio={name}");
                    devices.push(
                        Device::new(format!("audio{index}"), DeviceClass::Audio, name)
                            .with_capability(Capability::AudioInput)
                            .with_detail("input", input),
                    );
                }
            }
            Platform::Linux | Platform::Other => {}
        }
        Ok(devices)
    }

    /// Resolved output for a recording, or the played file for playback.
    fn target(&self, params: &StartParams) -> Result<PathBuf> {
        match params {
            StartParams::AudioRecord(opts) => Ok(platform::resolve_output(
                opts.output_file.as_deref(),
                &self.capture.resolved_output_dir(),
                "recording",
                "wav",
                Local::now(),
            )),
            StartParams::Playback(opts) => Ok(opts.file.clone()),
            other => Err(PeriphError::InvalidArgument {
                tool: "audio".into(),
                reason: format!("audio cannot run a {} session", other.kind()),
            }),
        }
    }
}

#[async_trait]
impl SessionBackend for AudioBackend {
    fn class(&self) -> DeviceClass {
        DeviceClass::Audio
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        match self.platform {
            Platform::Linux => self.list_alsa().await,
            Platform::MacOs | Platform::Windows => self.list_from_ffmpeg().await,
            Platform::Other => Ok(Vec::new()),
        }
    }

    fn prepare(&self, device: &Device, params: &StartParams) -> Result<PathBuf> {
        let output = self.target(params)?;
        match params {
            StartParams::AudioRecord(opts) => {
                record_args(self.platform, device, opts, &output)?;
            }
            StartParams::Playback(opts) => {
                if !opts.file.is_file() {
                    return Err(PeriphError::NotFound {
                        entity: "file",
                        id: opts.file.display().to_string(),
                    });
                }
                playback_args(self.platform, device, opts)?;
            }
            _ => {}
        }
        Ok(output)
    }

    async fn start(&self, request: StartRequest, sink: EventSink) -> Result<BackendHandle> {
        let (args, output) = match &request.params {
            StartParams::AudioRecord(opts) => {
                ensure_parent(&request.output).await?;
                (
                    record_args(self.platform, &request.device, opts, &request.output)?,
                    Some(request.output.clone()),
                )
            }
            StartParams::Playback(opts) => (playback_args(self.platform, &request.device, opts)?, None),
            other => {
                return Err(PeriphError::InvalidArgument {
                    tool: "audio".into(),
                    reason: format!("audio cannot run a {} session", other.kind()),
                });
            }
        };

        let handle = self
            .ffmpeg
            .spawn(
                &format!("ffmpeg:{}", request.device.id),
                &args,
                request.session_id,
                sink,
                output,
            )
            .await?;
        info!(
            session.id = %request.session_id,
            device = %request.device.id,
            kind = %request.params.kind(),
            file = %request.output.display(),
            "audio session started"
        );
        Ok(handle)
    }

    async fn stop(&self, handle: BackendHandle) -> Result<()> {
        self.ffmpeg.stop_checked(handle).await
    }

    async fn poll(&self, handle: HandleId) -> Result<BackendStatus> {
        Ok(self.ffmpeg.poll(handle))
    }
}

// ─── Argument builders ──────────────────────────────────────────

pub fn record_args(
    platform: Platform,
    device: &Device,
    opts: &AudioRecordOptions,
    output: &Path,
) -> Result<Vec<String>> {
    let invalid = |reason: String| PeriphError::InvalidArgument {
        tool: "start_audio_recording".into(),
        reason,
    };
    if !device.supports(Capability::AudioInput) {
        return Err(invalid(format!("{} is not an input device", device.id)));
    }
    if !SAMPLE_RATES.contains(&opts.sample_rate) {
        return Err(invalid(format!(
            "sample rate {} outside {}..={}",
            opts.sample_rate,
            SAMPLE_RATES.start(),
            SAMPLE_RATES.end()
        )));
    }
    if opts.channels == 0 || opts.channels > MAX_CHANNELS {
        return Err(invalid(format!(
            "channels must be between 1 and {MAX_CHANNELS}, got {}",
            opts.channels
        )));
    }
    if let Some(secs) = opts.duration_secs
        && !(secs.is_finite() && secs > 0.0)
    {
        return Err(invalid(format!("duration must be positive, got {secs}")));
    }

    let format = match platform {
        Platform::Linux => "alsa",
        Platform::MacOs => "avfoundation",
        Platform::Windows => "dshow",
        Platform::Other => return Err(unsupported(platform, "recording")),
    };
    let input = device
        .details
        .get("input")
        .and_then(|v| v.as_str())
        .unwrap_or("default");

    let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y", "-f", format, "-i", input]);
    args.extend([
        "-ac".into(),
        opts.channels.to_string(),
        "-ar".into(),
        opts.sample_rate.to_string(),
    ]);
    if let Some(secs) = opts.duration_secs {
        args.push("-t".into());
        args.push(secs.to_string());
    }
    args.push(output.display().to_string());
    Ok(args)
}

pub fn playback_args(platform: Platform, device: &Device, opts: &PlaybackOptions) -> Result<Vec<String>> {
    if !device.supports(Capability::AudioOutput) {
        return Err(PeriphError::InvalidArgument {
            tool: "play_audio".into(),
            reason: format!("{} is not an output device", device.id),
        });
    }
    let sink = device
        .details
        .get("output")
        .and_then(|v| v.as_str())
        .unwrap_or("default");

    let mut args = strings(&["-hide_banner", "-loglevel", "error", "-re", "-i"]);
    args.push(opts.file.display().to_string());
    match platform {
        Platform::Linux => args.extend(strings(&["-f", "alsa", sink])),
        Platform::MacOs => {
            args.extend(strings(&["-f", "audiotoolbox"]));
            if sink != "default" {
                args.extend(strings(&["-audio_device_index", sink]));
            }
            args.push("-".into());
        }
        Platform::Windows | Platform::Other => return Err(unsupported(platform, "playback")),
    }
    Ok(args)
}

fn unsupported(platform: Platform, what: &str) -> PeriphError {
    PeriphError::backend(format!("audio {what} is not supported on {platform:?}"))
}

// ─── Enumeration helpers ────────────────────────────────────────

/// The system default device. Playback is only wired up where ffmpeg has an
/// output device for the platform.
fn default_device(platform: Platform) -> Device {
    let device = Device::new("default", DeviceClass::Audio, "System default")
        .with_capability(Capability::AudioInput)
        .with_detail("input", default_input(platform));
    match platform {
        Platform::Linux | Platform::MacOs => device
            .with_capability(Capability::AudioOutput)
            .with_detail("output", "default"),
        Platform::Windows | Platform::Other => device,
    }
}

fn default_input(platform: Platform) -> &'static str {
    match platform {
        Platform::MacOs => ":default",
        Platform::Windows => "audio=default",
        Platform::Linux | Platform::Other => "default",
    }
}

/// Parse `/proc/asound/pcm`:
///
/// ```text
/// 00-00: ALC3246 Analog : ALC3246 Analog : playback 1 : capture 1
/// 00-03: HDMI 0 : HDMI 0 : playback 1
/// ```
pub fn parse_asound_pcm(pcm: &str) -> Vec<Device> {
    pcm.lines()
        .filter_map(|line| {
            let (slot, rest) = line.split_once(": ")?;
            let (card, dev) = slot.trim().split_once('-')?;
            let card: u32 = card.parse().ok()?;
            let dev: u32 = dev.parse().ok()?;
            let fields: Vec<&str> = rest.split(" : ").map(str::trim).collect();
            let name = fields.get(1).or(fields.first())?.to_string();
            let hw = format!("hw:{card},{dev}");

            let mut device = Device::new(hw.clone(), DeviceClass::Audio, name);
            if fields.iter().any(|f| f.starts_with("capture")) {
                device = device
                    .with_capability(Capability::AudioInput)
                    .with_detail("input", hw.clone());
            }
            if fields.iter().any(|f| f.starts_with("playback")) {
                device = device
                    .with_capability(Capability::AudioOutput)
                    .with_detail("output", hw);
            }
            Some(device)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PCM: &str = "\
00-00: ALC3246 Analog : ALC3246 Analog : playback 1 : capture 1
00-03: HDMI 0 : HDMI 0 : playback 1
01-00: USB Audio : USB Audio : capture 1
";

    #[test]
    fn test_parse_asound_pcm() {
        let devices = parse_asound_pcm(PCM);
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].id, "hw:0,0");
        assert!(devices[0].supports(Capability::AudioInput));
        assert!(devices[0].supports(Capability::AudioOutput));

        assert_eq!(devices[1].name, "HDMI 0");
        assert!(!devices[1].supports(Capability::AudioInput));

        assert_eq!(devices[2].id, "hw:1,0");
        assert!(!devices[2].supports(Capability::AudioOutput));
        assert_eq!(devices[2].details["input"], "hw:1,0");
    }

    #[test]
    fn test_record_args_linux() {
        let device = &parse_asound_pcm(PCM)[2];
        let opts = AudioRecordOptions {
            duration_secs: Some(5.0),
            sample_rate: 48_000,
            channels: 2,
            output_file: None,
        };
        let args = record_args(Platform::Linux, device, &opts, Path::new("/tmp/r.wav")).unwrap();
        assert_eq!(
            args.join(" "),
            "-hide_banner -loglevel error -y -f alsa -i hw:1,0 -ac 2 -ar 48000 -t 5 /tmp/r.wav"
        );
    }

    #[test]
    fn test_record_args_validation() {
        let device = default_device(Platform::Linux);
        let out = Path::new("/tmp/r.wav");
        let bad_rate = AudioRecordOptions {
            sample_rate: 100,
            ..Default::default()
        };
        assert!(record_args(Platform::Linux, &device, &bad_rate, out).is_err());
        let bad_channels = AudioRecordOptions {
            channels: 0,
            ..Default::default()
        };
        assert!(record_args(Platform::Linux, &device, &bad_channels, out).is_err());
        let bad_duration = AudioRecordOptions {
            duration_secs: Some(-1.0),
            ..Default::default()
        };
        assert!(record_args(Platform::Linux, &device, &bad_duration, out).is_err());

        let hdmi = &parse_asound_pcm(PCM)[1];
        let err =
            record_args(Platform::Linux, hdmi, &AudioRecordOptions::default(), out).unwrap_err();
        assert!(err.to_string().contains("not an input device"));
    }

    #[test]
    fn test_playback_args_per_platform() {
        let opts = PlaybackOptions {
            file: PathBuf::from("/tmp/song.wav"),
        };
        let linux = playback_args(Platform::Linux, &default_device(Platform::Linux), &opts).unwrap();
        assert_eq!(
            linux.join(" "),
            "-hide_banner -loglevel error -re -i /tmp/song.wav -f alsa default"
        );

        let mac = playback_args(Platform::MacOs, &default_device(Platform::MacOs), &opts).unwrap();
        assert!(mac.join(" ").ends_with("-f audiotoolbox -"));

        let windows = default_device(Platform::Windows);
        assert!(playback_args(Platform::Windows, &windows, &opts).is_err());
    }

    #[test]
    fn test_prepare_playback_requires_file() {
        let backend = AudioBackend::new(CaptureConfig::default()).with_platform(Platform::Linux);
        let params = StartParams::Playback(PlaybackOptions {
            file: PathBuf::from("/definitely/missing.wav"),
        });
        let err = backend
            .prepare(&default_device(Platform::Linux), &params)
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_prepare_recording_default_name() {
        let backend = AudioBackend::new(CaptureConfig::default()).with_platform(Platform::Linux);
        let out = backend
            .prepare(
                &default_device(Platform::Linux),
                &StartParams::AudioRecord(AudioRecordOptions::default()),
            )
            .unwrap();
        let name = out.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("recording_") && name.ends_with(".wav"));
    }

    #[tokio::test]
    async fn test_audio_has_no_still_capture() {
        let backend = AudioBackend::new(CaptureConfig::default()).with_platform(Platform::Linux);
        let target = std::env::temp_dir().join("periph-audio-still.jpg");
        let err = backend
            .capture(&default_device(Platform::Linux), Some(target.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "backend_error");
        assert!(err.to_string().contains("cannot capture stills"));
        assert!(!target.exists());
    }
}
