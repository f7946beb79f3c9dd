//! Print jobs: local mirror of spooler state, reconciled by polling.
//!
//! The spooler is authoritative. The local table only records what was
//! submitted and the last state observed, except that a terminal state the
//! poller has already committed (an accepted cancel, say) is never reopened.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use periph_config::PrinterConfig;
use periph_core::{Device, DeviceClass, EngineEvent, EventBus, JobState, PeriphError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{CancelAck, PrintFormat, PrintOptions, Spooler, SpoolerJobState};
use crate::catalog::DeviceCatalog;
use crate::status::JobStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintJob {
    /// Assigned by the spooler.
    pub id: String,
    pub device_id: String,
    pub state: JobState,
    pub file: PathBuf,
    pub options: PrintOptions,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Printer details plus what is queued on it locally.
#[derive(Debug, Clone, Serialize)]
pub struct PrinterStatus {
    pub printer: Device,
    pub queued: usize,
    pub printing: usize,
}

pub struct JobPoller {
    catalog: DeviceCatalog,
    config: PrinterConfig,
    jobs: Mutex<HashMap<String, PrintJob>>,
    bus: EventBus,
}

impl JobPoller {
    pub fn new(catalog: DeviceCatalog, config: PrinterConfig, bus: EventBus) -> Self {
        Self {
            catalog,
            config,
            jobs: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Submit `file` to a printer and record the job as `Queued`.
    pub async fn submit(&self, device_id: &str, file: &Path, options: PrintOptions) -> Result<String> {
        let spooler = self.spooler()?;
        if options.copies == 0 {
            return Err(PeriphError::InvalidArgument {
                tool: "print_file".into(),
                reason: "copies must be at least 1".into(),
            });
        }
        if tokio::fs::metadata(file).await.is_err() {
            return Err(PeriphError::NotFound {
                entity: "file",
                id: file.display().to_string(),
            });
        }
        let printer = self.catalog.find(DeviceClass::Printer, device_id).await?;

        let job_id = spooler.submit(&printer, file, &options).await?;
        let now = Utc::now();
        let job = PrintJob {
            id: job_id.clone(),
            device_id: printer.id.clone(),
            state: JobState::Queued,
            file: file.to_path_buf(),
            options,
            submitted_at: now,
            updated_at: now,
            ended_at: None,
            last_error: None,
        };
        self.jobs.lock().insert(job_id.clone(), job);

        info!(job.id = %job_id, device.id = %printer.id, file = %file.display(), "print job submitted");
        self.bus.publish(EngineEvent::JobSubmitted {
            job_id: job_id.clone(),
            device_id: printer.id,
        });
        Ok(job_id)
    }

    /// Submit with the document declared as PDF.
    pub async fn print_as_pdf(
        &self,
        device_id: &str,
        file: &Path,
        mut options: PrintOptions,
    ) -> Result<String> {
        options.format = PrintFormat::Pdf;
        self.submit(device_id, file, options).await
    }

    pub fn get(&self, job_id: &str) -> Result<PrintJob> {
        self.catalog.ensure_enabled(DeviceClass::Printer)?;
        self.jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| not_found(job_id))
    }

    /// Jobs, optionally for one printer, oldest first.
    pub fn list(&self, device_id: Option<&str>) -> Vec<PrintJob> {
        let mut jobs: Vec<PrintJob> = self
            .jobs
            .lock()
            .values()
            .filter(|j| device_id.is_none_or(|d| j.device_id == d))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Pull the spooler's state for one job into the local table.
    pub async fn refresh(&self, job_id: &str) -> Result<PrintJob> {
        let job = self.get(job_id)?;
        if job.state.is_terminal() {
            return Ok(job);
        }

        let spooler = self.spooler()?;
        let observed = spooler.status(job_id).await?;
        let (state, error) = map_spooler_state(observed);
        self.apply(job_id, state, error)
    }

    /// Refresh then render. A spooler failure falls back to the last known state.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus> {
        let job = match self.refresh(job_id).await {
            Ok(job) => job,
            Err(e @ (PeriphError::NotFound { .. } | PeriphError::FeatureDisabled(_))) => {
                return Err(e);
            }
            Err(e) => {
                warn!(job.id = job_id, error = %e, "spooler refresh failed, reporting cached state");
                self.get(job_id)?
            }
        };
        Ok(JobStatus::from_job(&job, Utc::now()))
    }

    /// Ask the spooler to cancel. A terminal job is returned unchanged.
    pub async fn cancel(&self, job_id: &str) -> Result<PrintJob> {
        let job = self.get(job_id)?;
        if job.state.is_terminal() {
            return Ok(job);
        }

        let spooler = self.spooler()?;
        match spooler.cancel(job_id).await? {
            CancelAck::Accepted => self.apply(job_id, JobState::Cancelled, None),
            CancelAck::Refused(reason) => {
                warn!(job.id = job_id, %reason, "spooler refused cancellation");
                Err(PeriphError::CancelRejected {
                    job_id: job_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Refresh every non-terminal job. Returns how many changed state.
    pub async fn refresh_all(&self) -> usize {
        let pending: Vec<(String, JobState)> = self
            .jobs
            .lock()
            .values()
            .filter(|j| !j.state.is_terminal())
            .map(|j| (j.id.clone(), j.state))
            .collect();

        let mut changed = 0;
        for (job_id, before) in pending {
            match self.refresh(&job_id).await {
                Ok(job) if job.state != before => changed += 1,
                Ok(_) => {}
                Err(e) => warn!(job.id = %job_id, error = %e, "job refresh failed"),
            }
        }
        changed
    }

    /// Drop terminal jobs that ended before `now - job_retention_secs`.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let retention = match chrono::Duration::from_std(self.config.job_retention()) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };
        let mut jobs = self.jobs.lock();
        let expired: Vec<String> = jobs
            .values()
            .filter(|j| j.ended_at.is_some_and(|end| now.signed_duration_since(end) >= retention))
            .map(|j| j.id.clone())
            .collect();
        for id in &expired {
            jobs.remove(id);
            debug!(job.id = %id, "print job evicted");
        }
        expired
    }

    pub async fn printer_status(&self, device_id: &str) -> Result<PrinterStatus> {
        let printer = self.catalog.find(DeviceClass::Printer, device_id).await?;
        let jobs = self.list(Some(device_id));
        Ok(PrinterStatus {
            printer,
            queued: jobs.iter().filter(|j| j.state == JobState::Queued).count(),
            printing: jobs.iter().filter(|j| j.state == JobState::Printing).count(),
        })
    }

    /// Poll the spooler at `poll_interval_secs` until `token` fires.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_secs = self.config.poll_interval().as_secs(), "job poller started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.catalog.is_enabled(DeviceClass::Printer) {
                        continue;
                    }
                    let changed = self.refresh_all().await;
                    let evicted = self.evict_expired(Utc::now());
                    if changed > 0 || !evicted.is_empty() {
                        debug!(changed, evicted = evicted.len(), "job poll");
                    }
                }
            }
        }
        info!("job poller stopped");
    }

    // ── Internals ──────────────────────────────────────────────

    fn spooler(&self) -> Result<Arc<dyn Spooler>> {
        self.catalog.ensure_enabled(DeviceClass::Printer)?;
        self.catalog
            .backends()
            .spooler()
            .ok_or_else(|| PeriphError::backend("no printer spooler is available"))
    }

    /// Record an observed state. A job already terminal locally keeps its state.
    fn apply(&self, job_id: &str, state: JobState, error: Option<String>) -> Result<PrintJob> {
        let mut jobs = self.jobs.lock();
        // Evicted while the spooler call was in flight.
        let job = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;

        let from = job.state;
        if from.is_terminal() || from == state {
            return Ok(job.clone());
        }

        let now = Utc::now();
        job.state = state;
        job.updated_at = now;
        if state.is_terminal() {
            job.ended_at = Some(now);
        }
        if state == JobState::Failed {
            job.last_error = Some(error.unwrap_or_else(|| "spooler aborted the job".into()));
        }
        let snapshot = job.clone();
        drop(jobs);

        info!(job.id = job_id, %from, to = %state, "print job transition");
        self.bus.publish(EngineEvent::JobUpdated {
            job_id: job_id.to_string(),
            from,
            to: state,
        });
        Ok(snapshot)
    }
}

fn map_spooler_state(observed: SpoolerJobState) -> (JobState, Option<String>) {
    match observed {
        SpoolerJobState::Pending => (JobState::Queued, None),
        SpoolerJobState::Processing => (JobState::Printing, None),
        SpoolerJobState::Completed => (JobState::Completed, None),
        SpoolerJobState::Cancelled => (JobState::Cancelled, None),
        SpoolerJobState::Aborted(reason) => (JobState::Failed, Some(reason)),
    }
}

fn not_found(job_id: &str) -> PeriphError {
    PeriphError::NotFound {
        entity: "print job",
        id: job_id.to_string(),
    }
}
