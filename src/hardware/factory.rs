use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::{DeviceDriver, DriverError};
use crate::channel::Value;
use crate::config::EssConfig;
use crate::domain::EssChannel;

/// Hardware mode configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Simulated devices for development and testing
    #[default]
    Simulated,
    /// No device attached; every read fails so channels stay undefined
    Offline,
}

/// Driver standing in for a device that cannot be reached.
#[derive(Debug, Clone)]
pub struct OfflineDriver {
    id: String,
}

impl OfflineDriver {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl DeviceDriver for OfflineDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn channels(&self) -> Vec<String> {
        use strum::IntoEnumIterator;
        EssChannel::iter()
            .filter(|c| c.is_measurement())
            .map(|c| c.as_ref().to_string())
            .collect()
    }

    async fn read(&self) -> Result<Vec<(String, Value)>, DriverError> {
        Err(DriverError::Communication(format!("{} is offline", self.id)))
    }

    async fn write(&self, _values: &[(String, Value)]) -> Result<(), DriverError> {
        Err(DriverError::Communication(format!("{} is offline", self.id)))
    }
}

/// Factory for creating device drivers
pub struct DeviceFactory {
    mode: HardwareMode,
}

impl DeviceFactory {
    pub fn new(mode: HardwareMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> HardwareMode {
        self.mode
    }

    /// Create the driver for one configured ESS
    pub fn create_ess(&self, config: &EssConfig) -> Arc<dyn DeviceDriver> {
        match self.mode {
            #[cfg(feature = "sim")]
            HardwareMode::Simulated => Arc::new(super::SimulatedEss::new(
                config.id.clone(),
                config.kind,
                config.sim.clone(),
            )),
            #[cfg(not(feature = "sim"))]
            HardwareMode::Simulated => {
                tracing::warn!(ess = %config.id, "simulation support not compiled in, using offline driver");
                Arc::new(OfflineDriver::new(config.id.clone()))
            }
            HardwareMode::Offline => Arc::new(OfflineDriver::new(config.id.clone())),
        }
    }

    pub fn create_all(&self, configs: &[EssConfig]) -> Vec<Arc<dyn DeviceDriver>> {
        configs.iter().map(|c| self.create_ess(c)).collect()
    }
}
