//! Caller-facing status documents. Pure projections; nothing here mutates.

use chrono::{DateTime, Utc};
use periph_core::{JobState, SessionId, SessionKind, SessionState};
use serde::Serialize;
use std::path::PathBuf;

use crate::jobs::PrintJob;
use crate::registry::Session;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub device_id: String,
    pub kind: SessionKind,
    pub state: SessionState,
    pub output: PathBuf,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds since start, frozen at the end time once terminal.
    pub elapsed_secs: f64,
    /// Present only for `Failed` sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub revision: u64,
}

impl SessionStatus {
    pub fn from_session(session: &Session, now: DateTime<Utc>) -> Self {
        let error = match session.state {
            SessionState::Failed => session.last_error.clone(),
            _ => None,
        };
        Self {
            session_id: session.id,
            device_id: session.device_id.clone(),
            kind: session.kind,
            state: session.state,
            output: session.output.clone(),
            started_at: session.started_at,
            ended_at: session.ended_at,
            elapsed_secs: elapsed(session.started_at, session.ended_at, now),
            error,
            revision: session.revision,
        }
    }

    /// One line for tool text output.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} session {} on {}: {} ({:.1}s) -> {}",
            self.kind,
            self.session_id,
            self.device_id,
            self.state,
            self.elapsed_secs,
            self.output.display()
        );
        if let Some(ref e) = self.error {
            line.push_str(&format!(" [error: {e}]"));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub device_id: String,
    pub state: JobState,
    pub file: PathBuf,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    pub fn from_job(job: &PrintJob, now: DateTime<Utc>) -> Self {
        let error = match job.state {
            JobState::Failed => job.last_error.clone(),
            _ => None,
        };
        Self {
            job_id: job.id.clone(),
            device_id: job.device_id.clone(),
            state: job.state,
            file: job.file.clone(),
            submitted_at: job.submitted_at,
            ended_at: job.ended_at,
            elapsed_secs: elapsed(job.submitted_at, job.ended_at, now),
            error,
        }
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "print job {} on {}: {} ({})",
            self.job_id,
            self.device_id,
            self.state,
            self.file.display()
        );
        if let Some(ref e) = self.error {
            line.push_str(&format!(" [error: {e}]"));
        }
        line
    }
}

fn elapsed(start: DateTime<Utc>, end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let until = end.unwrap_or(now);
    let millis = until.signed_duration_since(start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(state: SessionState) -> Session {
        let started_at = Utc::now() - Duration::seconds(12);
        Session {
            id: SessionId::new(),
            device_id: "cam0".into(),
            kind: SessionKind::VideoRecording,
            state,
            output: PathBuf::from("/tmp/out.mp4"),
            started_at,
            ended_at: state
                .is_terminal()
                .then(|| started_at + Duration::seconds(10)),
            last_error: Some("ffmpeg exited with status 1".into()),
            revision: 7,
        }
    }

    #[test]
    fn test_elapsed_frozen_once_terminal() {
        let s = session(SessionState::Completed);
        let status = SessionStatus::from_session(&s, Utc::now());
        assert_eq!(status.elapsed_secs, 10.0);
    }

    #[test]
    fn test_elapsed_runs_while_active() {
        let s = session(SessionState::Running);
        let status = SessionStatus::from_session(&s, s.started_at + Duration::seconds(3));
        assert_eq!(status.elapsed_secs, 3.0);
    }

    #[test]
    fn test_error_only_for_failed() {
        let running = SessionStatus::from_session(&session(SessionState::Running), Utc::now());
        assert!(running.error.is_none());
        let failed = SessionStatus::from_session(&session(SessionState::Failed), Utc::now());
        assert_eq!(failed.error.as_deref(), Some("ffmpeg exited with status 1"));
        assert!(failed.summary().contains("[error: ffmpeg exited with status 1]"));
    }

    #[test]
    fn test_clock_skew_clamps_to_zero() {
        let s = session(SessionState::Running);
        let status = SessionStatus::from_session(&s, s.started_at - Duration::seconds(5));
        assert_eq!(status.elapsed_secs, 0.0);
    }

    #[test]
    fn test_status_json_shape() {
        let status = SessionStatus::from_session(&session(SessionState::Running), Utc::now());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["kind"], "video_recording");
        assert!(json.get("error").is_none());
        assert!(json.get("ended_at").is_none());
    }
}
