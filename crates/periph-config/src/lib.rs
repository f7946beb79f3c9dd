//! # periph-config
//!
//! Configuration for the periph runtime. Reads from `periph.toml`, then applies
//! `PERIPH_*` environment overrides.
//!
//! A loaded [`PeriphConfig`] is an immutable snapshot: the session engine is
//! built from it, and picking up a changed file means reloading and rebuilding.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::PeriphConfig;
pub use schema::{
    CaptureConfig, ConfigWarning, DevicesConfig, LoggingConfig, PrinterConfig, SessionsConfig,
    WarningSeverity,
};
