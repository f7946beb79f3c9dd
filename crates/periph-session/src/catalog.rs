//! Device enumeration across classes, gated by the enable flags.

use periph_config::DevicesConfig;
use periph_core::{Device, DeviceClass, PeriphError, Result};
use tracing::{debug, warn};

use crate::backend::BackendSet;

/// Read-only view over every enabled backend's device list.
#[derive(Clone)]
pub struct DeviceCatalog {
    flags: DevicesConfig,
    backends: BackendSet,
}

impl DeviceCatalog {
    pub fn new(flags: DevicesConfig, backends: BackendSet) -> Self {
        Self { flags, backends }
    }

    pub fn is_enabled(&self, class: DeviceClass) -> bool {
        self.flags.is_enabled(class)
    }

    /// Fail with `FeatureDisabled` when the class is turned off.
    pub fn ensure_enabled(&self, class: DeviceClass) -> Result<()> {
        if self.flags.is_enabled(class) {
            Ok(())
        } else {
            Err(PeriphError::FeatureDisabled(class))
        }
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    /// Devices of one class. An empty backend slot yields an empty list.
    pub async fn list(&self, class: DeviceClass) -> Result<Vec<Device>> {
        self.ensure_enabled(class)?;
        let devices = match class {
            DeviceClass::Printer => match self.backends.spooler() {
                Some(spooler) => spooler.printers().await?,
                None => Vec::new(),
            },
            DeviceClass::Storage => match self.backends.storage() {
                Some(storage) => storage.volumes().await?,
                None => Vec::new(),
            },
            _ => match self.backends.session_backend(class) {
                Some(backend) => backend.devices().await?,
                None => Vec::new(),
            },
        };
        debug!(%class, count = devices.len(), "enumerated devices");
        Ok(devices)
    }

    /// Devices of every enabled class. A failing backend is logged and skipped.
    pub async fn list_all(&self) -> Vec<Device> {
        let mut all = Vec::new();
        for class in self.flags.enabled() {
            match self.list(class).await {
                Ok(mut devices) => all.append(&mut devices),
                Err(e) => warn!(%class, error = %e, "device enumeration failed"),
            }
        }
        all
    }

    pub async fn find(&self, class: DeviceClass, device_id: &str) -> Result<Device> {
        self.list(class)
            .await?
            .into_iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| PeriphError::NotFound {
                entity: "device",
                id: device_id.to_string(),
            })
    }

    /// Look a device up by id in any enabled class.
    pub async fn find_any(&self, device_id: &str) -> Result<Device> {
        self.list_all()
            .await
            .into_iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| PeriphError::NotFound {
                entity: "device",
                id: device_id.to_string(),
            })
    }
}
