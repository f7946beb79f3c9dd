use parking_lot::RwLock;
use periph_core::{DeviceClass, PeriphError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::PeriphConfig;

/// Loads the periph configuration and hands out immutable snapshots.
pub struct ConfigLoader {
    config: Arc<RwLock<PeriphConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > PERIPH_CONFIG env > ~/.periph/periph.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("PERIPH_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".periph")
            .join("periph.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> periph_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            PeriphConfig::default()
        };

        let config = Self::apply_env_overrides(config, |key| std::env::var(key).ok());
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (no file backing).
    pub fn from_config(config: PeriphConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        }
    }

    /// Get a snapshot of the current config.
    pub fn get(&self) -> PeriphConfig {
        self.config.read().clone()
    }

    /// Path the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn parse_file(path: &Path) -> periph_core::Result<PeriphConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<PeriphConfig>(&raw).map_err(|e| {
            PeriphError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    fn check(config: &PeriphConfig) -> periph_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(PeriphError::Config(e)),
        }
    }

    /// Apply `PERIPH_*` overrides. `lookup` abstracts the environment.
    pub fn apply_env_overrides<F>(mut config: PeriphConfig, lookup: F) -> PeriphConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        for class in DeviceClass::ALL {
            let key = format!("PERIPH_ENABLE_{}", class.as_str().to_ascii_uppercase());
            if let Some(v) = lookup(&key) {
                match parse_bool(&v) {
                    Some(enabled) => config.devices.set_enabled(class, enabled),
                    None => warn!(%key, value = %v, "ignoring non-boolean override"),
                }
            }
        }
        if let Some(v) = lookup("PERIPH_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("PERIPH_FFMPEG") {
            config.capture.ffmpeg_path = v;
        }
        config
    }

    /// Re-read the file and return the fresh snapshot.
    ///
    /// Engines built from the previous snapshot keep it; callers rebuild them
    /// from the returned value.
    pub fn reload(&self) -> periph_core::Result<PeriphConfig> {
        if !self.config_path.exists() {
            return Err(PeriphError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::parse_file(&self.config_path)?;
        let new_config = Self::apply_env_overrides(new_config, |key| std::env::var(key).ok());
        Self::check(&new_config)?;
        *self.config.write() = new_config.clone();
        info!("configuration reloaded");
        Ok(new_config)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
