//! CUPS print spooler.
//!
//! Talks to CUPS through its command-line clients: `lp` submits, `lpstat`
//! reports queues and jobs, `cancel` cancels, and `lpoptions` tells us what
//! each queue supports. The spooler stays authoritative for job state; this
//! module only translates its answers.

use async_trait::async_trait;
use periph_config::PrinterConfig;
use periph_core::{Capability, Device, DeviceClass, PeriphError, Result};
use periph_session::{CancelAck, PrintFormat, PrintOptions, Spooler, SpoolerJobState};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::process::{self, strings};

const COMMAND_LIMIT: Duration = Duration::from_secs(15);

/// One queue line of `lpstat -p`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub state: QueueState,
    /// Job currently printing, from "now printing X".
    pub printing: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Printing,
    Disabled,
}

impl QueueState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Printing => "printing",
            Self::Disabled => "disabled",
        }
    }
}

pub struct CupsSpooler {
    config: PrinterConfig,
}

impl CupsSpooler {
    pub fn new(config: PrinterConfig) -> Self {
        Self { config }
    }

    async fn queues(&self) -> Result<Vec<QueueInfo>> {
        let output = process::run_output(&self.config.lpstat_path, &strings(&["-p"]), COMMAND_LIMIT).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No destinations") {
                return Ok(Vec::new());
            }
            return Err(PeriphError::backend(format!(
                "lpstat -p failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(parse_lpstat_queues(&stdout))
    }

    async fn default_queue(&self) -> Option<String> {
        match process::run_command(&self.config.lpstat_path, &strings(&["-d"]), COMMAND_LIMIT).await {
            Ok(out) => parse_default_destination(&out),
            Err(e) => {
                debug!(error = %e, "no default destination");
                None
            }
        }
    }

    async fn queue_capabilities(&self, queue: &str) -> Vec<Capability> {
        let args = strings(&["-p", queue, "-l"]);
        match process::run_command(&self.config.lpoptions_path, &args, COMMAND_LIMIT).await {
            Ok(out) => parse_lpoptions_capabilities(&out),
            Err(e) => {
                debug!(queue, error = %e, "could not read queue options");
                Vec::new()
            }
        }
    }

    /// Job ids listed by `lpstat -W <which> -o`.
    async fn listed_jobs(&self, which: &str) -> Result<HashSet<String>> {
        let args = strings(&["-W", which, "-o"]);
        let out = process::run_command(&self.config.lpstat_path, &args, COMMAND_LIMIT).await?;
        Ok(parse_job_ids(&out))
    }
}

#[async_trait]
impl Spooler for CupsSpooler {
    async fn printers(&self) -> Result<Vec<Device>> {
        let queues = self.queues().await?;
        let default = self.default_queue().await;
        let mut devices = Vec::with_capacity(queues.len());
        for queue in queues {
            let mut device = Device::new(queue.name.clone(), DeviceClass::Printer, queue.name.clone())
                .with_capability(Capability::Pdf)
                .with_detail("state", queue.state.as_str())
                .with_detail("is_default", default.as_deref() == Some(queue.name.as_str()));
            for cap in self.queue_capabilities(&queue.name).await {
                device = device.with_capability(cap);
            }
            devices.push(device);
        }
        Ok(devices)
    }

    async fn submit(&self, printer: &Device, file: &Path, options: &PrintOptions) -> Result<String> {
        let args = lp_args(&printer.id, file, options);
        let out = process::run_command(&self.config.lp_path, &args, COMMAND_LIMIT).await?;
        let job_id = parse_request_id(&out).ok_or_else(|| {
            PeriphError::backend(format!("lp did not report a job id: {}", out.trim()))
        })?;
        info!(job.id = %job_id, printer = %printer.id, "submitted to CUPS");
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<SpoolerJobState> {
        if self.listed_jobs("not-completed").await?.contains(job_id) {
            let printing = self
                .queues()
                .await?
                .iter()
                .any(|q| q.printing.as_deref() == Some(job_id));
            return Ok(if printing {
                SpoolerJobState::Processing
            } else {
                SpoolerJobState::Pending
            });
        }
        if self.listed_jobs("completed").await?.contains(job_id) {
            return Ok(SpoolerJobState::Completed);
        }
        Ok(SpoolerJobState::Aborted(format!(
            "job {job_id} is no longer known to CUPS"
        )))
    }

    async fn cancel(&self, job_id: &str) -> Result<CancelAck> {
        let output =
            process::run_output(&self.config.cancel_path, &strings(&[job_id]), COMMAND_LIMIT).await?;
        if output.status.success() {
            Ok(CancelAck::Accepted)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Ok(CancelAck::Refused(if stderr.is_empty() {
                format!("cancel exited with {}", output.status)
            } else {
                stderr
            }))
        }
    }
}

// ─── Command builders / parsers ─────────────────────────────────

pub fn lp_args(queue: &str, file: &Path, options: &PrintOptions) -> Vec<String> {
    let mut args = strings(&["-d", queue, "-n"]);
    args.push(options.copies.to_string());
    if options.double_sided {
        args.extend(strings(&["-o", "sides=two-sided-long-edge"]));
    }
    if !options.color {
        args.extend(strings(&["-o", "ColorModel=Gray"]));
    }
    if options.format == PrintFormat::Pdf {
        args.extend(strings(&["-o", "document-format=application/pdf"]));
    }
    args.push("--".into());
    args.push(file.display().to_string());
    args
}

/// `request id is HP_LaserJet-42 (1 file(s))` → `HP_LaserJet-42`.
pub fn parse_request_id(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("request id is ")?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

/// Parse `lpstat -p`:
///
/// ```text
/// printer HP_LaserJet is idle.  enabled since Mon 01 Jan 2024 10:00:00 AM UTC
/// printer Office is now printing Office-7.  enabled since ...
/// printer Old disabled since Tue 02 Jan 2024 ...
/// ```
pub fn parse_lpstat_queues(stdout: &str) -> Vec<QueueInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("printer ")?;
            let (name, status) = rest.split_once(' ')?;
            let (state, printing) = if let Some(job) = status.strip_prefix("is now printing ") {
                let job = job.split_whitespace().next()?.trim_end_matches('.');
                (QueueState::Printing, Some(job.to_string()))
            } else if status.starts_with("disabled") {
                (QueueState::Disabled, None)
            } else {
                (QueueState::Idle, None)
            };
            Some(QueueInfo {
                name: name.to_string(),
                state,
                printing,
            })
        })
        .collect()
}

/// `system default destination: HP_LaserJet`
pub fn parse_default_destination(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let name = line.trim().strip_prefix("system default destination:")?.trim();
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// First column of `lpstat -o` lines.
pub fn parse_job_ids(stdout: &str) -> HashSet<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Duplex and color support from `lpoptions -p <queue> -l`:
///
/// ```text
/// Duplex/2-Sided Printing: *None DuplexNoTumble DuplexTumble
/// ColorModel/Color Mode: Gray *RGB
/// ```
pub fn parse_lpoptions_capabilities(stdout: &str) -> Vec<Capability> {
    let mut caps = Vec::new();
    for line in stdout.lines() {
        let Some((key, values)) = line.split_once(':') else {
            continue;
        };
        let key = key.split('/').next().unwrap_or(key).trim();
        let values: Vec<&str> = values
            .split_whitespace()
            .map(|v| v.trim_start_matches('*'))
            .collect();
        match key {
            "Duplex" | "sides" if values.iter().any(|v| *v != "None" && *v != "one-sided") => {
                caps.push(Capability::Duplex)
            }
            "ColorModel" | "print-color-mode"
                if values
                    .iter()
                    .any(|v| matches!(*v, "RGB" | "CMYK" | "Color" | "color")) =>
            {
                caps.push(Capability::Color)
            }
            _ => {}
        }
    }
    caps
}
