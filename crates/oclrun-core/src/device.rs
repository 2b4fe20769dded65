//! Device enumeration and selection.
//!
//! Queries the backend for compute devices of a requested class on one
//! platform. Which platform is a configuration point, not a hidden
//! constant: the default of `platform_index = 0` preserves the common
//! single-platform setup, and the CLI exposes `--platform` to override.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::backend::{DeviceBackend, DeviceId};
use crate::error::{OclError, Result};

/// Class of compute device to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum DeviceClass {
    /// Discrete or integrated GPUs.
    #[default]
    Gpu,
    /// CPU devices exposed by the platform.
    Cpu,
    /// Dedicated accelerators.
    Accelerator,
    /// Any device class.
    All,
}

impl DeviceClass {
    /// Whether a device of class `other` satisfies a request for `self`.
    pub fn matches(self, other: DeviceClass) -> bool {
        self == DeviceClass::All || self == other
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => write!(f, "gpu"),
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator => write!(f, "accelerator"),
            Self::All => write!(f, "all"),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(Self::Gpu),
            "cpu" => Ok(Self::Cpu),
            "accelerator" => Ok(Self::Accelerator),
            "all" => Ok(Self::All),
            other => Err(format!("unknown device class '{other}'. Expected one of: gpu, cpu, accelerator, all")),
        }
    }
}

/// Introspection snapshot for one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Device vendor string.
    pub vendor: String,
    /// Device class reported by the platform.
    pub class: DeviceClass,
    /// Maximum work-group size the device accepts.
    pub max_work_group_size: usize,
    /// Global memory size in bytes (0 when the platform does not report it).
    pub global_mem_bytes: u64,
}

/// Configuration for the enumerator.
#[derive(Debug, Clone)]
pub struct EnumeratorConfig {
    /// Platform index to query (0-based).
    pub platform_index: usize,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self { platform_index: 0 }
    }
}

/// Queries the platform for compute devices of a requested class.
pub struct DeviceEnumerator {
    backend: Arc<dyn DeviceBackend>,
    config: EnumeratorConfig,
}

impl DeviceEnumerator {
    /// Create an enumerator over `backend` with the given configuration.
    pub fn new(backend: Arc<dyn DeviceBackend>, config: EnumeratorConfig) -> Self {
        Self { backend, config }
    }

    /// The configured platform index.
    pub fn platform_index(&self) -> usize {
        self.config.platform_index
    }

    /// Devices of `class` on the configured platform.
    ///
    /// Fails with [`OclError::Enumeration`] when the platform does not
    /// exist or no device of the class is present.
    pub fn list_devices(&self, class: DeviceClass) -> Result<Vec<DeviceId>> {
        debug!(platform = self.config.platform_index, %class, "enumerating devices");
        let devices = self.backend.list_devices(self.config.platform_index, class)?;
        if devices.is_empty() {
            return Err(OclError::Enumeration {
                reason: format!(
                    "no {class} devices on platform {}",
                    self.config.platform_index
                ),
            });
        }
        info!(
            platform = self.config.platform_index,
            %class,
            count = devices.len(),
            "devices enumerated"
        );
        Ok(devices)
    }

    /// Introspection snapshot for one device.
    pub fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        self.backend.device_info(device)
    }
}
