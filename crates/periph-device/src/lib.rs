//! # periph-device
//!
//! Platform backends and the tool surface for periph.
//!
//! - **Camera, audio, screen**: ffmpeg child processes per session, with a
//!   supervisor that watches for natural exit
//! - **Printer**: the CUPS command-line clients
//! - **Storage**: read-only volume listing from `/proc` and `/sys`
//!
//! The tool layer ([`DeviceTools`]) routes tool calls into the session engine
//! and the print job poller from `periph-session`.

pub mod audio;
pub mod camera;
pub mod platform;
pub mod printer;
pub mod process;
pub mod screen;
pub mod storage;
pub mod tools;

use periph_config::PeriphConfig;
use periph_core::DeviceClass;
use periph_session::BackendSet;
use std::sync::Arc;

pub use audio::AudioBackend;
pub use camera::CameraBackend;
pub use platform::Platform;
pub use printer::CupsSpooler;
pub use process::ProcessSupervisor;
pub use screen::ScreenBackend;
pub use storage::SysStorage;
pub use tools::DeviceTools;

/// Platform backends for every enabled device class. Disabled classes get
/// no backend at all, so nothing ever probes their hardware.
pub fn build_backends(config: &PeriphConfig) -> BackendSet {
    let devices = &config.devices;
    let mut set = BackendSet::new();
    if devices.is_enabled(DeviceClass::Camera) {
        set = set.with_camera(Arc::new(CameraBackend::new(config.capture.clone())));
    }
    if devices.is_enabled(DeviceClass::Audio) {
        set = set.with_audio(Arc::new(AudioBackend::new(config.capture.clone())));
    }
    if devices.is_enabled(DeviceClass::Screen) {
        set = set.with_screen(Arc::new(ScreenBackend::new(config.capture.clone())));
    }
    if devices.is_enabled(DeviceClass::Printer) {
        set = set.with_printer(Arc::new(CupsSpooler::new(config.printer.clone())));
    }
    if devices.is_enabled(DeviceClass::Storage) {
        set = set.with_storage(Arc::new(SysStorage::new()));
    }
    set
}
