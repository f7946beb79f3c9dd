//! # periph-core
//!
//! Core types and primitives shared by every periph crate: the error taxonomy,
//! the device / session / job state vocabulary, tool-call types, and the
//! engine event bus.

pub mod error;
pub mod event;
pub mod tool;
pub mod types;

pub use error::{PeriphError, Result};
pub use event::{EngineEvent, EventBus};
pub use tool::{Tool, ToolCall, ToolExecutor, ToolResult};
pub use types::*;
