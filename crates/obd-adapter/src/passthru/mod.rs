//! SAE J2534 PassThru Adapter
//!
//! The adapter drives any [`PassThruApi`] implementation. The vendor library
//! binding lives in [`native`] behind the `ffi` feature; tests inject a
//! scripted implementation instead.

#[cfg(feature = "ffi")]
pub mod native;

use crate::adapter::DeviceAdapter;
use crate::capabilities::{AdapterConfig, DeviceCapabilities, DeviceKind, DeviceStatus, FirmwareVersion};
use crate::channel::{ChannelHandle, ChannelSlot};
use crate::error::{AdapterError, AdapterResult, PassThruStatus};
use async_trait::async_trait;
use obd_protocol::codec::can;
use obd_protocol::{Transport, TransportFamily};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connect flag: the interface neither adds nor checks K-line checksums
pub const ISO9141_NO_CHECKSUM: u32 = 0x0000_0200;
/// Rx status bit marking a loopback of our own transmission
pub const TX_MSG_TYPE: u32 = 0x0000_0001;
/// Tx flag selecting 29-bit CAN identifiers
pub const CAN_29BIT_ID: u32 = 0x0000_0100;

/// Ioctl ids
pub mod ioctl {
    pub const GET_CONFIG: u32 = 0x01;
    pub const SET_CONFIG: u32 = 0x02;
    pub const READ_VBATT: u32 = 0x03;
    pub const READ_PROG_VOLTAGE: u32 = 0x04;
}

/// SET_CONFIG parameter: echo of transmitted messages
pub const CONFIG_LOOPBACK: u32 = 0x03;

/// Message filter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    Pass = 1,
    Block = 2,
    FlowControl = 3,
}

/// One J2534 message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassThruMsg {
    pub protocol_id: u32,
    pub rx_status: u32,
    pub tx_flags: u32,
    pub timestamp: u32,
    pub data: Vec<u8>,
}

impl PassThruMsg {
    pub fn new(protocol_id: u32, tx_flags: u32, data: Vec<u8>) -> Self {
        Self {
            protocol_id,
            tx_flags,
            data,
            ..Default::default()
        }
    }

    /// Whether this is the interface echoing our own frame
    pub fn is_echo(&self) -> bool {
        self.rx_status & TX_MSG_TYPE != 0
    }
}

/// Version strings reported by `PassThruReadVersion`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassThruVersion {
    pub firmware: String,
    pub dll: String,
    pub api: String,
}

/// The J2534 function surface. Calls block; the adapter runs them on the
/// blocking thread pool.
pub trait PassThruApi: Send + Sync {
    fn open(&self, name: Option<&str>) -> Result<u32, PassThruStatus>;
    fn close(&self, device_id: u32) -> Result<(), PassThruStatus>;
    fn connect(
        &self,
        device_id: u32,
        protocol_id: u32,
        flags: u32,
        baud_rate: u32,
    ) -> Result<u32, PassThruStatus>;
    fn disconnect(&self, channel_id: u32) -> Result<(), PassThruStatus>;
    fn read_msgs(
        &self,
        channel_id: u32,
        max_msgs: usize,
        timeout_ms: u32,
    ) -> Result<Vec<PassThruMsg>, PassThruStatus>;
    fn write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        timeout_ms: u32,
    ) -> Result<usize, PassThruStatus>;
    fn start_msg_filter(
        &self,
        channel_id: u32,
        filter: FilterType,
        mask: &PassThruMsg,
        pattern: &PassThruMsg,
    ) -> Result<u32, PassThruStatus>;
    /// Ioctl returning a single value, e.g. `READ_VBATT`
    fn ioctl(&self, id: u32, ioctl_id: u32) -> Result<u32, PassThruStatus>;
    /// `SET_CONFIG` with (parameter, value) pairs
    fn set_config(&self, channel_id: u32, params: &[(u32, u32)]) -> Result<(), PassThruStatus>;
    fn read_version(&self, device_id: u32) -> Result<PassThruVersion, PassThruStatus>;
}

#[derive(Debug, Default)]
struct Session {
    device_id: Option<u32>,
    /// Native channel id of the open channel
    channel_id: Option<u32>,
    version: Option<PassThruVersion>,
}

/// Adapter over a J2534 PassThru interface
pub struct PassThruAdapter {
    api: Arc<dyn PassThruApi>,
    session: Mutex<Session>,
    slot: ChannelSlot,
}

impl PassThruAdapter {
    pub fn new(api: Arc<dyn PassThruApi>) -> Self {
        Self {
            api,
            session: Mutex::new(Session::default()),
            slot: ChannelSlot::new(),
        }
    }

    fn device_id(&self) -> AdapterResult<u32> {
        self.session.lock().device_id.ok_or(AdapterError::NotInitialized)
    }

    fn channel_id(&self) -> AdapterResult<u32> {
        self.session.lock().channel_id.ok_or(AdapterError::ChannelClosed)
    }

    /// Run a blocking PassThru call off the async executor
    async fn blocking<T, F>(&self, op: &'static str, call: F) -> AdapterResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PassThruApi) -> Result<T, PassThruStatus> + Send + 'static,
    {
        let api = self.api.clone();
        tokio::task::spawn_blocking(move || call(api.as_ref()))
            .await
            .map_err(|e| AdapterError::Io(format!("{} worker failed: {}", op, e)))?
            .map_err(|status| AdapterError::PassThru { op, status })
    }

    async fn close_native_channel(&self) {
        let channel = self.session.lock().channel_id.take();
        if let Some(channel_id) = channel {
            if let Err(e) = self
                .blocking("PassThruDisconnect", move |api| api.disconnect(channel_id))
                .await
            {
                warn!("PassThru disconnect of channel {} failed: {}", channel_id, e);
            }
        }
    }

    async fn read_until_frame(
        &self,
        channel_id: u32,
        timeout: Duration,
    ) -> AdapterResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout_ms = remaining.as_millis() as u32;
            let msgs = self
                .blocking("PassThruReadMsgs", move |api| {
                    api.read_msgs(channel_id, 1, timeout_ms)
                })
                .await?;
            if let Some(msg) = msgs.into_iter().find(|m| !m.is_echo()) {
                return Ok(msg.data);
            }
            if remaining.is_zero() {
                return Err(AdapterError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }
}

fn parse_firmware(version: &PassThruVersion) -> Option<FirmwareVersion> {
    version
        .firmware
        .split_whitespace()
        .find_map(|token| token.parse().ok())
}

#[async_trait]
impl DeviceAdapter for PassThruAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::PassThru
    }

    async fn initialize(&self, config: &AdapterConfig) -> AdapterResult<DeviceCapabilities> {
        let name = config.library.clone();
        let device_id = self
            .blocking("PassThruOpen", move |api| api.open(name.as_deref()))
            .await
            .map_err(|e| AdapterError::OpenFailed(e.to_string()))?;

        let version = match self
            .blocking("PassThruReadVersion", move |api| api.read_version(device_id))
            .await
        {
            Ok(version) => Some(version),
            Err(e) => {
                warn!("PassThru version unavailable: {}", e);
                None
            }
        };
        let firmware = version.as_ref().and_then(parse_firmware);
        info!("PassThru device {} opened ({:?})", device_id, version);

        *self.session.lock() = Session {
            device_id: Some(device_id),
            channel_id: None,
            version,
        };

        Ok(DeviceCapabilities {
            kind: DeviceKind::PassThru,
            transports: Transport::ALL.to_vec(),
            max_sample_rate_hz: 100,
            multi_bus: false,
            safety_limits: None,
            firmware_version: firmware,
            supports_tuning: false,
        })
    }

    async fn connect(
        &self,
        transport: Transport,
        flags: u32,
        baud_rate: u32,
    ) -> AdapterResult<ChannelHandle> {
        let device_id = self.device_id()?;
        if let Some(old) = self.slot.close_any() {
            debug!("PassThru closing {} before reconnect", old);
        }
        self.close_native_channel().await;

        let protocol_id = transport.passthru_protocol_id();
        let flags = if transport.family() == TransportFamily::KLine {
            // Checksums are produced and verified by the codec
            flags | ISO9141_NO_CHECKSUM
        } else {
            flags
        };
        let channel_id = self
            .blocking("PassThruConnect", move |api| {
                api.connect(device_id, protocol_id, flags, baud_rate)
            })
            .await?;

        if let Err(e) = self
            .blocking("PassThruIoctl", move |api| {
                api.set_config(channel_id, &[(CONFIG_LOOPBACK, 0)])
            })
            .await
        {
            debug!("PassThru loopback not configurable: {}", e);
        }

        let (mask, pattern) = if transport.is_can() {
            let (mask, pattern) = can::response_filter(transport.is_extended_id());
            (mask.to_be_bytes().to_vec(), pattern.to_be_bytes().to_vec())
        } else {
            (vec![0x00], vec![0x00])
        };
        let filter = self
            .blocking("PassThruStartMsgFilter", move |api| {
                api.start_msg_filter(
                    channel_id,
                    FilterType::Pass,
                    &PassThruMsg::new(protocol_id, 0, mask),
                    &PassThruMsg::new(protocol_id, 0, pattern),
                )
            })
            .await;
        if let Err(e) = filter {
            let _ = self
                .blocking("PassThruDisconnect", move |api| api.disconnect(channel_id))
                .await;
            return Err(e);
        }

        self.session.lock().channel_id = Some(channel_id);
        let handle = self.slot.open(transport);
        info!(
            "PassThru connected {} (native {}) on {}",
            handle, channel_id, transport
        );
        Ok(handle)
    }

    async fn disconnect(&self, handle: ChannelHandle) -> AdapterResult<()> {
        self.slot.close(handle)?;
        let channel = self.session.lock().channel_id.take();
        if let Some(channel_id) = channel {
            self.blocking("PassThruDisconnect", move |api| api.disconnect(channel_id))
                .await?;
        }
        Ok(())
    }

    async fn send_frame(
        &self,
        handle: ChannelHandle,
        frame: &[u8],
        timeout: Duration,
    ) -> AdapterResult<()> {
        let transport = self.slot.check(handle)?;
        let channel_id = self.channel_id()?;
        let tx_flags = if transport.is_extended_id() { CAN_29BIT_ID } else { 0 };
        let msg = PassThruMsg::new(transport.passthru_protocol_id(), tx_flags, frame.to_vec());
        let timeout_ms = timeout.as_millis() as u32;

        let written = self
            .slot
            .with_cancel(
                handle,
                self.blocking("PassThruWriteMsgs", move |api| {
                    api.write_msgs(channel_id, std::slice::from_ref(&msg), timeout_ms)
                }),
            )
            .await?;
        if written == 0 {
            return Err(AdapterError::Timeout {
                timeout_ms: timeout_ms as u64,
            });
        }
        Ok(())
    }

    async fn receive_frame(
        &self,
        handle: ChannelHandle,
        timeout: Duration,
    ) -> AdapterResult<Vec<u8>> {
        self.slot.check(handle)?;
        let channel_id = self.channel_id()?;
        self.slot
            .with_cancel(handle, self.read_until_frame(channel_id, timeout))
            .await
    }

    async fn read_voltage(&self) -> AdapterResult<f64> {
        let device_id = self.device_id()?;
        let millivolts = self
            .blocking("PassThruIoctl", move |api| api.ioctl(device_id, ioctl::READ_VBATT))
            .await?;
        Ok(millivolts as f64 / 1000.0)
    }

    async fn read_status(&self) -> AdapterResult<DeviceStatus> {
        self.device_id()?;
        let version = self.session.lock().version.clone();
        let voltage = self.read_voltage().await.ok();
        let transport = self.slot.transport();
        Ok(DeviceStatus {
            kind: DeviceKind::PassThru,
            firmware_version: version.as_ref().and_then(parse_firmware),
            description: version
                .map(|v| format!("J2534 firmware {} dll {} api {}", v.firmware, v.dll, v.api))
                .unwrap_or_else(|| "J2534 PassThru".to_string()),
            voltage,
            active_transport: transport,
            channel_open: transport.is_some(),
        })
    }

    fn is_channel_open(&self, handle: ChannelHandle) -> bool {
        self.slot.is_open(handle)
    }

    async fn shutdown(&self) -> AdapterResult<()> {
        self.slot.close_any();
        self.close_native_channel().await;
        let device = self.session.lock().device_id.take();
        if let Some(device_id) = device {
            self.blocking("PassThruClose", move |api| api.close(device_id))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted interface recording every call
    #[derive(Default)]
    struct MockPassThru {
        connects: Mutex<Vec<(u32, u32, u32)>>,
        disconnects: Mutex<Vec<u32>>,
        filters: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
        written: Mutex<Vec<PassThruMsg>>,
        inbox: Mutex<VecDeque<Result<Vec<PassThruMsg>, PassThruStatus>>>,
        open_status: Option<PassThruStatus>,
    }

    impl PassThruApi for MockPassThru {
        fn open(&self, _name: Option<&str>) -> Result<u32, PassThruStatus> {
            match self.open_status {
                Some(status) => Err(status),
                None => Ok(7),
            }
        }

        fn close(&self, _device_id: u32) -> Result<(), PassThruStatus> {
            Ok(())
        }

        fn connect(&self, _device: u32, protocol: u32, flags: u32, baud: u32) -> Result<u32, PassThruStatus> {
            let mut connects = self.connects.lock();
            connects.push((protocol, flags, baud));
            Ok(100 + connects.len() as u32)
        }

        fn disconnect(&self, channel_id: u32) -> Result<(), PassThruStatus> {
            self.disconnects.lock().push(channel_id);
            Ok(())
        }

        fn read_msgs(&self, _channel: u32, _max: usize, _timeout: u32) -> Result<Vec<PassThruMsg>, PassThruStatus> {
            self.inbox
                .lock()
                .pop_front()
                .unwrap_or(Err(PassThruStatus::BufferEmpty))
        }

        fn write_msgs(&self, _channel: u32, msgs: &[PassThruMsg], _timeout: u32) -> Result<usize, PassThruStatus> {
            self.written.lock().extend_from_slice(msgs);
            Ok(msgs.len())
        }

        fn start_msg_filter(
            &self,
            _channel: u32,
            _filter: FilterType,
            mask: &PassThruMsg,
            pattern: &PassThruMsg,
        ) -> Result<u32, PassThruStatus> {
            self.filters.lock().push((mask.data.clone(), pattern.data.clone()));
            Ok(1)
        }

        fn ioctl(&self, _id: u32, ioctl_id: u32) -> Result<u32, PassThruStatus> {
            match ioctl_id {
                ioctl::READ_VBATT => Ok(12_800),
                _ => Err(PassThruStatus::InvalidIoctl),
            }
        }

        fn set_config(&self, _channel: u32, _params: &[(u32, u32)]) -> Result<(), PassThruStatus> {
            Err(PassThruStatus::NotSupported)
        }

        fn read_version(&self, _device_id: u32) -> Result<PassThruVersion, PassThruStatus> {
            Ok(PassThruVersion {
                firmware: "4.2.0".into(),
                dll: "1.0".into(),
                api: "04.04".into(),
            })
        }
    }

    async fn adapter(mock: Arc<MockPassThru>) -> PassThruAdapter {
        let adapter = PassThruAdapter::new(mock);
        adapter.initialize(&AdapterConfig::default()).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_open_failure_is_fatal() {
        let mock = Arc::new(MockPassThru {
            open_status: Some(PassThruStatus::NullParameter),
            ..Default::default()
        });
        let adapter = PassThruAdapter::new(mock);
        let err = adapter.initialize(&AdapterConfig::default()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_can_connect_installs_response_filter() {
        let mock = Arc::new(MockPassThru::default());
        let adapter = adapter(mock.clone()).await;
        let transport = Transport::Iso15765_4Can11bit500;
        adapter
            .connect(transport, transport.connect_flags(), 500_000)
            .await
            .unwrap();
        assert_eq!(mock.connects.lock()[0], (5, 0, 500_000));
        assert_eq!(
            mock.filters.lock()[0],
            (vec![0xFF, 0xFF, 0xFF, 0xF8], vec![0x00, 0x00, 0x07, 0xE8])
        );
    }

    #[tokio::test]
    async fn test_kline_connect_disables_interface_checksum() {
        let mock = Arc::new(MockPassThru::default());
        let adapter = adapter(mock.clone()).await;
        adapter.connect(Transport::Iso9141_2, 0, 10_400).await.unwrap();
        assert_eq!(mock.connects.lock()[0], (3, ISO9141_NO_CHECKSUM, 10_400));
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_channel() {
        let mock = Arc::new(MockPassThru::default());
        let adapter = adapter(mock.clone()).await;
        let first = adapter.connect(Transport::Iso15765_4Can11bit500, 0, 500_000).await.unwrap();
        adapter.connect(Transport::Iso9141_2, 0, 10_400).await.unwrap();
        assert_eq!(*mock.disconnects.lock(), vec![101]);
        assert!(!adapter.is_channel_open(first));
    }

    #[tokio::test]
    async fn test_receive_skips_echo() {
        let mock = Arc::new(MockPassThru::default());
        let echo = PassThruMsg {
            rx_status: TX_MSG_TYPE,
            data: vec![0, 0, 0x07, 0xDF],
            ..Default::default()
        };
        let reply = PassThruMsg::new(5, 0, vec![0, 0, 0x07, 0xE8, 0x03, 0x41, 0x0D, 0x32]);
        mock.inbox.lock().push_back(Ok(vec![echo]));
        mock.inbox.lock().push_back(Ok(vec![reply.clone()]));

        let adapter = adapter(mock).await;
        let handle = adapter.connect(Transport::Iso15765_4Can11bit500, 0, 500_000).await.unwrap();
        let frame = adapter
            .receive_frame(handle, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(frame, reply.data);
    }

    #[tokio::test]
    async fn test_status_codes_surface_verbatim() {
        let mock = Arc::new(MockPassThru::default());
        mock.inbox.lock().push_back(Err(PassThruStatus::Timeout));
        let adapter = adapter(mock).await;
        let handle = adapter.connect(Transport::Iso15765_4Can11bit500, 0, 500_000).await.unwrap();
        let err = adapter
            .receive_frame(handle, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdapterError::PassThru {
                op: "PassThruReadMsgs",
                status: PassThruStatus::Timeout
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_voltage_from_ioctl() {
        let adapter = adapter(Arc::new(MockPassThru::default())).await;
        assert_eq!(adapter.read_voltage().await.unwrap(), 12.8);
        let status = adapter.read_status().await.unwrap();
        assert_eq!(status.firmware_version, Some(FirmwareVersion::new(4, 2, 0)));
    }

    #[tokio::test]
    async fn test_29bit_send_sets_tx_flag() {
        let mock = Arc::new(MockPassThru::default());
        let adapter = adapter(mock.clone()).await;
        let transport = Transport::Iso15765_4Can29bit500;
        let handle = adapter
            .connect(transport, transport.connect_flags(), 500_000)
            .await
            .unwrap();
        adapter
            .send_frame(handle, &[0x18, 0xDB, 0x33, 0xF1, 0x01, 0x03], Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(mock.written.lock()[0].tx_flags, CAN_29BIT_ID);
    }
}
