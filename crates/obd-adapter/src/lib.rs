//! OBD-II Device Adapters
//!
//! One async [`DeviceAdapter`] contract over the supported interfaces:
//! J2534 PassThru libraries, ELM327 serial dongles, the postcard-framed
//! microcontroller bridge and an in-process vehicle simulator.

mod adapter;
pub mod bridge;
mod capabilities;
mod channel;
pub mod elm327;
mod error;
mod factory;
pub mod passthru;
pub mod simulator;

pub use adapter::DeviceAdapter;
pub use bridge::BridgeAdapter;
pub use capabilities::{
    check_tuning_compatibility, AdapterConfig, DeviceCapabilities, DeviceKind, DeviceStatus,
    FirmwareVersion, MIN_TUNING_FIRMWARE,
};
pub use channel::{ChannelHandle, ChannelSlot};
pub use elm327::Elm327Adapter;
pub use error::{AdapterError, AdapterResult, PassThruStatus};
pub use factory::{AdapterFactory, DefaultAdapterFactory};
pub use passthru::{PassThruAdapter, PassThruApi};
pub use simulator::{Fault, Simulator, SimulatorConfig};
