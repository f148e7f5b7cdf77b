//! Device adapter capability trait

use crate::capabilities::{AdapterConfig, DeviceCapabilities, DeviceKind, DeviceStatus};
use crate::channel::ChannelHandle;
use crate::error::{AdapterError, AdapterResult};
use async_trait::async_trait;
use obd_protocol::Transport;
use safety_validator::ControlCommand;
use std::time::Duration;

/// One interface device. Frames cross this boundary in the common byte
/// layout: CAN as a 4-byte big-endian id followed by data, J1850 and K-line
/// as the raw frame bytes (K-line including its checksum).
///
/// At most one channel is open. Connecting while a channel is open closes
/// it first.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Open and handshake with the device
    async fn initialize(&self, config: &AdapterConfig) -> AdapterResult<DeviceCapabilities>;

    /// Open a channel on `transport`
    async fn connect(
        &self,
        transport: Transport,
        flags: u32,
        baud_rate: u32,
    ) -> AdapterResult<ChannelHandle>;

    /// Close a channel; in-flight receives on it fail with `Cancelled`
    async fn disconnect(&self, handle: ChannelHandle) -> AdapterResult<()>;

    async fn send_frame(
        &self,
        handle: ChannelHandle,
        frame: &[u8],
        timeout: Duration,
    ) -> AdapterResult<()>;

    async fn receive_frame(&self, handle: ChannelHandle, timeout: Duration)
        -> AdapterResult<Vec<u8>>;

    /// Battery voltage in volts
    async fn read_voltage(&self) -> AdapterResult<f64>;

    async fn read_status(&self) -> AdapterResult<DeviceStatus>;

    fn is_channel_open(&self, handle: ChannelHandle) -> bool;

    /// Forward an already validated control command
    async fn write_parameter(
        &self,
        _handle: ChannelHandle,
        command: &ControlCommand,
    ) -> AdapterResult<()> {
        Err(AdapterError::Unsupported(format!(
            "{} cannot write {}",
            self.kind(),
            command.parameter
        )))
    }

    /// Release the device
    async fn shutdown(&self) -> AdapterResult<()> {
        Ok(())
    }
}
