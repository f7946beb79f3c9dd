//! # periph-session
//!
//! The device session and print-job lifecycle engine.
//!
//! ```text
//!   tool layer (periph-device)
//!       │
//!       ├── SessionEngine ──► SessionRegistry   (single arbitration point)
//!       │       │   ▲
//!       │       ▼   │ BackendEvent (mpsc)
//!       │   SessionBackend  camera | audio | screen
//!       │
//!       ├── JobPoller ─────► Spooler            (pull model)
//!       │
//!       └── status ── pure projection of sessions and jobs
//! ```
//!
//! Backends run outside every lock; only the bookkeeping that commits a
//! transition is serialized.

pub mod backend;
pub mod catalog;
pub mod engine;
pub mod jobs;
pub mod mock;
pub mod registry;
pub mod status;

pub use backend::{
    AudioRecordOptions, BackendEvent, BackendHandle, BackendOutcome, BackendSet, BackendStatus,
    CancelAck, EventSink, HandleId, PlaybackOptions, PrintFormat, PrintOptions, ScreenOptions,
    SessionBackend, Spooler, SpoolerJobState, StartParams, StartRequest, StorageCatalog,
    VideoOptions,
};
pub use catalog::DeviceCatalog;
pub use engine::{SessionEngine, SweepReport};
pub use jobs::{JobPoller, PrintJob, PrinterStatus};
pub use registry::{Session, SessionRegistry};
pub use status::{JobStatus, SessionStatus};
