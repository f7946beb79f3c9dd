use thiserror::Error;

use crate::types::DeviceClass;

/// Unified error type for the periph workspace.
#[derive(Error, Debug)]
pub enum PeriphError {
    // ── Lookup / exclusivity ───────────────────────────────────
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("device busy: {device_id} already hosts active session {session_id}")]
    DeviceBusy { device_id: String, session_id: String },

    // ── State machine ──────────────────────────────────────────
    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("feature disabled: {0} support is turned off")]
    FeatureDisabled(DeviceClass),

    // ── Backend / spooler ──────────────────────────────────────
    #[error("backend error: {message}")]
    Backend {
        message: String,
        /// Session left in `Failed` by this error, if any.
        session_id: Option<String>,
    },

    #[error("cancel rejected by spooler: {job_id}: {reason}")]
    CancelRejected { job_id: String, reason: String },

    #[error("timed out: {operation} exceeded {after_secs}s")]
    Timeout { operation: String, after_secs: u64 },

    // ── Tool surface ───────────────────────────────────────────
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("invalid argument: {tool}: {reason}")]
    InvalidArgument { tool: String, reason: String },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PeriphError {
    /// Shorthand for a backend failure not tied to a session.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            session_id: None,
        }
    }

    /// Stable machine-readable kind, used in structured tool errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::DeviceBusy { .. } => "device_busy",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::FeatureDisabled(_) => "feature_disabled",
            Self::Backend { .. } => "backend_error",
            Self::CancelRejected { .. } => "cancel_rejected",
            Self::Timeout { .. } => "timeout",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Config(_) | Self::ConfigValidation { .. } => "config_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Other(_) => "internal_error",
        }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }

    /// Session left behind in `Failed` by a backend error.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Backend { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PeriphError>;
