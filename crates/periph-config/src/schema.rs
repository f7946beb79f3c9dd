use periph_core::DeviceClass;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, maps to `periph.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriphConfig {
    pub devices: DevicesConfig,
    pub sessions: SessionsConfig,
    pub printer: PrinterConfig,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
}

// ── Devices ────────────────────────────────────────────────────

/// Per-class enable flags. A disabled class is neither advertised nor callable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub camera: bool,
    pub audio: bool,
    pub screen: bool,
    pub printer: bool,
    pub storage: bool,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            camera: true,
            audio: true,
            screen: true,
            printer: true,
            storage: true,
        }
    }
}

impl DevicesConfig {
    pub fn is_enabled(&self, class: DeviceClass) -> bool {
        match class {
            DeviceClass::Camera => self.camera,
            DeviceClass::Audio => self.audio,
            DeviceClass::Screen => self.screen,
            DeviceClass::Printer => self.printer,
            DeviceClass::Storage => self.storage,
        }
    }

    pub fn set_enabled(&mut self, class: DeviceClass, enabled: bool) {
        match class {
            DeviceClass::Camera => self.camera = enabled,
            DeviceClass::Audio => self.audio = enabled,
            DeviceClass::Screen => self.screen = enabled,
            DeviceClass::Printer => self.printer = enabled,
            DeviceClass::Storage => self.storage = enabled,
        }
    }

    /// Enabled classes in declaration order.
    pub fn enabled(&self) -> Vec<DeviceClass> {
        DeviceClass::ALL
            .into_iter()
            .filter(|c| self.is_enabled(*c))
            .collect()
    }
}

// ── Sessions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// A `Starting` session older than this is forcibly failed.
    pub start_timeout_secs: u64,
    /// Upper bound on waiting for a backend to acknowledge a stop.
    pub stop_timeout_secs: u64,
    /// Terminal sessions stay queryable this long after they end.
    pub retention_secs: u64,
    /// Shorter retention once a terminal state has been reported to a caller.
    pub reported_retention_secs: u64,
    /// How often the background sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: 10,
            stop_timeout_secs: 15,
            retention_secs: 300,
            reported_retention_secs: 30,
            sweep_interval_secs: 5,
        }
    }
}

impl SessionsConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reported_retention(&self) -> Duration {
        Duration::from_secs(self.reported_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ── Printer ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Interval between background spooler refreshes.
    pub poll_interval_secs: u64,
    /// Terminal jobs are dropped from the local table after this long.
    pub job_retention_secs: u64,
    pub lp_path: String,
    pub lpstat_path: String,
    pub cancel_path: String,
    /// Used to probe duplex and color support per queue.
    pub lpoptions_path: String,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            job_retention_secs: 3600,
            lp_path: "lp".into(),
            lpstat_path: "lpstat".into(),
            cancel_path: "cancel".into(),
            lpoptions_path: "lpoptions".into(),
        }
    }
}

impl PrinterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

// ── Capture ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// ffmpeg binary used by the camera, audio and screen backends.
    pub ffmpeg_path: String,
    /// Where default output files go (None = OS temp dir).
    pub output_dir: Option<PathBuf>,
    /// Grace period between asking ffmpeg to quit and killing it.
    pub stop_grace_secs: u64,
    pub default_fps: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".into(),
            output_dir: None,
            stop_grace_secs: 5,
            default_fps: 30.0,
        }
    }
}

impl CaptureConfig {
    pub fn resolved_output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{}: {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl PeriphConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Device classes ───
        if self.devices.enabled().is_empty() {
            warnings.push(ConfigWarning {
                field: "devices".into(),
                message: "every device class is disabled; no tools will be advertised".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Enable at least one of camera, audio, screen, printer, storage".into()),
            });
        }

        // ── Session timing ───
        if self.sessions.start_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "sessions.start_timeout_secs".into(),
                message: "start timeout is 0; every session start would time out".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 10".into()),
            });
        }
        if self.sessions.stop_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "sessions.stop_timeout_secs".into(),
                message: "stop timeout is 0; stops could never be acknowledged".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 15".into()),
            });
        }
        if self.sessions.reported_retention_secs > self.sessions.retention_secs {
            warnings.push(ConfigWarning {
                field: "sessions.reported_retention_secs".into(),
                message: format!(
                    "reported retention {}s exceeds retention {}s and has no effect",
                    self.sessions.reported_retention_secs, self.sessions.retention_secs
                ),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Capture ───
        if self.capture.ffmpeg_path.trim().is_empty() {
            warnings.push(ConfigWarning {
                field: "capture.ffmpeg_path".into(),
                message: "ffmpeg path is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Use \"ffmpeg\" to resolve from PATH".into()),
            });
        }
        if self.capture.default_fps <= 0.0 {
            warnings.push(ConfigWarning {
                field: "capture.default_fps".into(),
                message: format!("fps {} must be positive", self.capture.default_fps),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 30".into()),
            });
        }
        if self.sessions.stop_timeout_secs > 0
            && self.capture.stop_grace_secs >= self.sessions.stop_timeout_secs
        {
            warnings.push(ConfigWarning {
                field: "capture.stop_grace_secs".into(),
                message: format!(
                    "stop grace {}s is not below stop timeout {}s; stops fail before ffmpeg is killed",
                    self.capture.stop_grace_secs, self.sessions.stop_timeout_secs
                ),
                severity: WarningSeverity::Warning,
                hint: Some("Keep stop_grace_secs below sessions.stop_timeout_secs".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
