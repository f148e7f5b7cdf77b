//! Adapter construction from configuration

use crate::adapter::DeviceAdapter;
use crate::bridge::BridgeAdapter;
use crate::capabilities::{AdapterConfig, DeviceKind};
use crate::elm327::Elm327Adapter;
use crate::error::{AdapterError, AdapterResult};
use crate::passthru::{PassThruAdapter, PassThruApi};
use crate::simulator::{Simulator, SimulatorConfig};
use std::sync::Arc;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// Builds a device adapter for a configuration
pub trait AdapterFactory: Send + Sync {
    fn create(&self, config: &AdapterConfig) -> AdapterResult<Arc<dyn DeviceAdapter>>;
}

/// Serial devices open their port, PassThru uses the injected library or
/// the linked one, and the simulator is built from its own config.
#[derive(Default)]
pub struct DefaultAdapterFactory {
    passthru: Option<Arc<dyn PassThruApi>>,
    simulator: SimulatorConfig,
}

impl DefaultAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `api` instead of the linked PassThru library
    pub fn with_passthru(mut self, api: Arc<dyn PassThruApi>) -> Self {
        self.passthru = Some(api);
        self
    }

    pub fn with_simulator(mut self, config: SimulatorConfig) -> Self {
        self.simulator = config;
        self
    }

    fn passthru_api(&self) -> AdapterResult<Arc<dyn PassThruApi>> {
        if let Some(api) = &self.passthru {
            return Ok(api.clone());
        }
        #[cfg(feature = "ffi")]
        {
            Ok(Arc::new(crate::passthru::native::NativePassThru))
        }
        #[cfg(not(feature = "ffi"))]
        {
            Err(AdapterError::LibraryUnavailable(
                "built without the ffi feature".into(),
            ))
        }
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, config: &AdapterConfig) -> AdapterResult<Arc<dyn DeviceAdapter>> {
        info!("Creating {} adapter", config.kind);
        match config.kind {
            DeviceKind::Simulator => Ok(Arc::new(Simulator::new(self.simulator.clone()))),
            DeviceKind::PassThru => Ok(Arc::new(PassThruAdapter::new(self.passthru_api()?))),
            DeviceKind::Elm327 => {
                let port = config.require_port()?;
                let stream = tokio_serial::new(port, config.serial_baud_rate).open_native_async()?;
                Ok(Arc::new(Elm327Adapter::new(stream)))
            }
            DeviceKind::Bridge => {
                let port = config.require_port()?;
                let stream = tokio_serial::new(port, config.serial_baud_rate).open_native_async()?;
                Ok(Arc::new(BridgeAdapter::new(stream)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulator_by_default() {
        let adapter = DefaultAdapterFactory::new()
            .create(&AdapterConfig::default())
            .unwrap();
        assert_eq!(adapter.kind(), DeviceKind::Simulator);
    }

    #[test]
    fn test_serial_kinds_need_a_port() {
        let config = AdapterConfig {
            kind: DeviceKind::Elm327,
            ..Default::default()
        };
        assert!(matches!(
            DefaultAdapterFactory::new().create(&config),
            Err(AdapterError::InvalidConfiguration(_))
        ));
    }

    #[cfg(not(feature = "ffi"))]
    #[test]
    fn test_passthru_without_library() {
        let config = AdapterConfig {
            kind: DeviceKind::PassThru,
            ..Default::default()
        };
        assert!(matches!(
            DefaultAdapterFactory::new().create(&config),
            Err(AdapterError::LibraryUnavailable(_))
        ));
    }
}
