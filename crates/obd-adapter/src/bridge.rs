//! Microcontroller Bridge Adapter
//!
//! Request/response messages are serialized with postcard and COBS framed,
//! so a zero byte always ends a message on the wire. Every message travels in
//! an [`Envelope`] whose sequence number pairs a reply with its request; a
//! reply that arrives after its request timed out is dropped.

use crate::adapter::DeviceAdapter;
use crate::capabilities::{
    check_tuning_compatibility, AdapterConfig, DeviceCapabilities, DeviceKind, DeviceStatus,
    FirmwareVersion,
};
use crate::channel::{ChannelHandle, ChannelSlot};
use crate::error::{AdapterError, AdapterResult};
use async_trait::async_trait;
use obd_protocol::Transport;
use parking_lot::Mutex as SyncMutex;
use safety_validator::{ControlCommand, SafetyLimits};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Frame delimiter after COBS encoding
const DELIMITER: u8 = 0x00;
/// Slack on top of the bus timeout for the serial round trip
const LINK_SLACK: Duration = Duration::from_millis(200);
/// Bound on simple bridge commands
const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bridge error codes
pub mod code {
    pub const UNSUPPORTED: u8 = 1;
    pub const CONNECT_FAILED: u8 = 2;
    pub const BUS_ERROR: u8 = 3;
    pub const NO_CHANNEL: u8 = 4;
    pub const REJECTED: u8 = 5;
}

/// Host to bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeRequest {
    Hello,
    Connect {
        transport: Transport,
        flags: u32,
        baud_rate: u32,
    },
    Disconnect,
    Send {
        frame: Vec<u8>,
        timeout_ms: u32,
    },
    Receive {
        timeout_ms: u32,
    },
    ReadVoltage,
    Status,
    WriteParameter {
        name: String,
        value: f64,
    },
}

/// Handshake contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeHello {
    pub firmware: FirmwareVersion,
    pub board: String,
    pub transports: Vec<Transport>,
    pub supports_tuning: bool,
    pub max_sample_rate_hz: u32,
    pub safety_limits: Option<SafetyLimits>,
}

/// Bridge to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeResponse {
    Hello(BridgeHello),
    Ok,
    Frame(Vec<u8>),
    Timeout,
    NoData,
    Voltage { millivolts: u32 },
    Status { transport: Option<Transport> },
    Error { code: u8, message: String },
}

/// Sequenced wrapper; the bridge echoes `seq` in its reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub seq: u16,
    pub body: T,
}

/// Encode a message for the wire, delimiter included
pub fn encode<T: Serialize>(message: &T) -> AdapterResult<Vec<u8>> {
    postcard::to_allocvec_cobs(message)
        .map_err(|e| AdapterError::Io(format!("bridge encode failed: {}", e)))
}

/// Decode one delimited message in place
pub fn decode<'a, T: Deserialize<'a>>(frame: &'a mut [u8]) -> AdapterResult<T> {
    postcard::from_bytes_cobs(frame)
        .map_err(|e| AdapterError::Io(format!("malformed bridge message: {}", e)))
}

struct BridgeLink<S> {
    stream: BufReader<S>,
    rx: Vec<u8>,
    next_seq: u16,
}

impl<S> BridgeLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            rx: Vec::new(),
            next_seq: 0,
        }
    }

    async fn transact(
        &mut self,
        request: &BridgeRequest,
        timeout: Duration,
    ) -> AdapterResult<BridgeResponse> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        trace!("Bridge >> #{} {:?}", seq, request);
        let bytes = encode(&Envelope {
            seq,
            body: request,
        })?;
        self.stream.get_mut().write_all(&bytes).await?;
        self.stream.get_mut().flush().await?;

        let deadline = Instant::now() + timeout;
        loop {
            // Bytes kept from a cut-off read complete into a stale frame
            let read =
                tokio::time::timeout_at(deadline, self.stream.read_until(DELIMITER, &mut self.rx))
                    .await
                    .map_err(|_| AdapterError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })??;
            if read == 0 || self.rx.last() != Some(&DELIMITER) {
                return Err(AdapterError::Io("bridge stream closed".into()));
            }

            let mut frame = std::mem::take(&mut self.rx);
            match decode::<Envelope<BridgeResponse>>(&mut frame) {
                Ok(reply) if reply.seq == seq => {
                    trace!("Bridge << #{} {:?}", seq, reply.body);
                    return Ok(reply.body);
                }
                Ok(reply) => debug!("Bridge dropping stale reply #{} (want #{})", reply.seq, seq),
                Err(e) => debug!("Bridge dropping frame: {}", e),
            }
        }
    }
}

fn bridge_error(code: u8, message: String) -> AdapterError {
    match code {
        code::UNSUPPORTED | code::REJECTED => AdapterError::Unsupported(message),
        code::CONNECT_FAILED => AdapterError::ConnectFailed(message),
        code::NO_CHANNEL => AdapterError::ChannelClosed,
        _ => AdapterError::Io(message),
    }
}

fn unexpected(response: BridgeResponse) -> AdapterError {
    match response {
        BridgeResponse::Error { code, message } => bridge_error(code, message),
        other => AdapterError::Io(format!("unexpected bridge response {:?}", other)),
    }
}

/// Microcontroller bridge over stream `S`
pub struct BridgeAdapter<S> {
    link: Mutex<BridgeLink<S>>,
    slot: ChannelSlot,
    hello: SyncMutex<Option<BridgeHello>>,
}

impl<S> BridgeAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            link: Mutex::new(BridgeLink::new(stream)),
            slot: ChannelSlot::new(),
            hello: SyncMutex::new(None),
        }
    }

    fn require_hello(&self) -> AdapterResult<BridgeHello> {
        self.hello.lock().clone().ok_or(AdapterError::NotInitialized)
    }

    async fn request(&self, request: BridgeRequest, timeout: Duration) -> AdapterResult<BridgeResponse> {
        self.link.lock().await.transact(&request, timeout).await
    }
}

#[async_trait]
impl<S> DeviceAdapter for BridgeAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> DeviceKind {
        DeviceKind::Bridge
    }

    async fn initialize(&self, config: &AdapterConfig) -> AdapterResult<DeviceCapabilities> {
        let timeout = Duration::from_millis(config.init_timeout_ms);
        let hello = match self.request(BridgeRequest::Hello, timeout).await {
            Ok(BridgeResponse::Hello(hello)) => hello,
            Ok(other) => {
                return Err(AdapterError::InitializationFailed(format!(
                    "bad handshake: {}",
                    unexpected(other)
                )))
            }
            Err(e) => return Err(AdapterError::InitializationFailed(e.to_string())),
        };

        if hello.supports_tuning {
            check_tuning_compatibility(hello.firmware)?;
        }
        info!(
            "Bridge {} firmware {} (tuning: {})",
            hello.board, hello.firmware, hello.supports_tuning
        );

        let capabilities = DeviceCapabilities {
            kind: DeviceKind::Bridge,
            transports: hello.transports.clone(),
            max_sample_rate_hz: hello.max_sample_rate_hz,
            multi_bus: false,
            safety_limits: hello.safety_limits.clone(),
            firmware_version: Some(hello.firmware),
            supports_tuning: hello.supports_tuning,
        };
        *self.hello.lock() = Some(hello);
        Ok(capabilities)
    }

    async fn connect(
        &self,
        transport: Transport,
        flags: u32,
        baud_rate: u32,
    ) -> AdapterResult<ChannelHandle> {
        self.require_hello()?;
        if let Some(old) = self.slot.close_any() {
            debug!("Bridge closing {} before reconnect", old);
            match self.request(BridgeRequest::Disconnect, COMMAND_TIMEOUT).await {
                Ok(BridgeResponse::Ok) => {}
                Ok(other) => warn!("Bridge disconnect of {} answered {:?}", old, other),
                Err(e) => warn!("Bridge disconnect of {} failed: {}", old, e),
            }
        }
        let request = BridgeRequest::Connect {
            transport,
            flags,
            baud_rate,
        };
        match self.request(request, COMMAND_TIMEOUT).await? {
            BridgeResponse::Ok => {}
            other => return Err(unexpected(other)),
        }
        let handle = self.slot.open(transport);
        info!("Bridge connected {} on {}", handle, transport);
        Ok(handle)
    }

    async fn disconnect(&self, handle: ChannelHandle) -> AdapterResult<()> {
        self.slot.close(handle)?;
        match self.request(BridgeRequest::Disconnect, COMMAND_TIMEOUT).await? {
            BridgeResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn send_frame(
        &self,
        handle: ChannelHandle,
        frame: &[u8],
        timeout: Duration,
    ) -> AdapterResult<()> {
        self.slot.check(handle)?;
        let request = BridgeRequest::Send {
            frame: frame.to_vec(),
            timeout_ms: timeout.as_millis() as u32,
        };
        let response = self
            .slot
            .with_cancel(handle, self.request(request, timeout + LINK_SLACK))
            .await?;
        match response {
            BridgeResponse::Ok => Ok(()),
            BridgeResponse::Timeout => Err(AdapterError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn receive_frame(
        &self,
        handle: ChannelHandle,
        timeout: Duration,
    ) -> AdapterResult<Vec<u8>> {
        self.slot.check(handle)?;
        let request = BridgeRequest::Receive {
            timeout_ms: timeout.as_millis() as u32,
        };
        let response = self
            .slot
            .with_cancel(handle, self.request(request, timeout + LINK_SLACK))
            .await?;
        match response {
            BridgeResponse::Frame(frame) => Ok(frame),
            BridgeResponse::Timeout => Err(AdapterError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            BridgeResponse::NoData => Err(AdapterError::NoResponse),
            other => Err(unexpected(other)),
        }
    }

    async fn read_voltage(&self) -> AdapterResult<f64> {
        self.require_hello()?;
        match self.request(BridgeRequest::ReadVoltage, COMMAND_TIMEOUT).await? {
            BridgeResponse::Voltage { millivolts } => Ok(millivolts as f64 / 1000.0),
            other => Err(unexpected(other)),
        }
    }

    async fn read_status(&self) -> AdapterResult<DeviceStatus> {
        let hello = self.require_hello()?;
        let active_transport = match self.request(BridgeRequest::Status, COMMAND_TIMEOUT).await? {
            BridgeResponse::Status { transport } => transport,
            other => return Err(unexpected(other)),
        };
        let voltage = self.read_voltage().await.ok();
        Ok(DeviceStatus {
            kind: DeviceKind::Bridge,
            firmware_version: Some(hello.firmware),
            description: hello.board,
            voltage,
            active_transport,
            channel_open: self.slot.handle().is_some(),
        })
    }

    fn is_channel_open(&self, handle: ChannelHandle) -> bool {
        self.slot.is_open(handle)
    }

    async fn write_parameter(
        &self,
        handle: ChannelHandle,
        command: &ControlCommand,
    ) -> AdapterResult<()> {
        let hello = self.require_hello()?;
        if !hello.supports_tuning {
            return Err(AdapterError::Unsupported(format!(
                "bridge {} cannot write {}",
                hello.board, command.parameter
            )));
        }
        self.slot.check(handle)?;
        let request = BridgeRequest::WriteParameter {
            name: command.parameter.clone(),
            value: command.value,
        };
        match self.request(request, COMMAND_TIMEOUT).await? {
            BridgeResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn shutdown(&self) -> AdapterResult<()> {
        if let Some(handle) = self.slot.handle() {
            self.disconnect(handle).await?;
        }
        *self.hello.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn hello(firmware: FirmwareVersion, tuning: bool) -> BridgeHello {
        BridgeHello {
            firmware,
            board: "obd-bridge-rev2".into(),
            transports: vec![Transport::Iso15765_4Can11bit500, Transport::Iso9141_2],
            supports_tuning: tuning,
            max_sample_rate_hz: 50,
            safety_limits: Some(SafetyLimits::default()),
        }
    }

    /// Fake firmware answering decoded requests through `reply`
    fn spawn_fake_bridge<F>(server: DuplexStream, reply: F)
    where
        F: Fn(BridgeRequest) -> BridgeResponse + Send + 'static,
    {
        spawn_slow_bridge(server, reply, |_| Duration::ZERO);
    }

    /// Like `spawn_fake_bridge`, holding each reply back by `delay`
    fn spawn_slow_bridge<F, D>(server: DuplexStream, reply: F, mut delay: D)
    where
        F: Fn(BridgeRequest) -> BridgeResponse + Send + 'static,
        D: FnMut(&BridgeRequest) -> Duration + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            loop {
                let mut buf = Vec::new();
                match reader.read_until(DELIMITER, &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let Ok(request) = decode::<Envelope<BridgeRequest>>(&mut buf) else {
                    break;
                };
                let pause = delay(&request.body);
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                let reply = Envelope {
                    seq: request.seq,
                    body: reply(request.body),
                };
                let Ok(bytes) = encode(&reply) else {
                    break;
                };
                if reader.get_mut().write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });
    }

    fn firmware(tuning: bool, version: FirmwareVersion) -> impl Fn(BridgeRequest) -> BridgeResponse {
        move |request| match request {
            BridgeRequest::Hello => BridgeResponse::Hello(hello(version, tuning)),
            BridgeRequest::Connect { transport, .. } if transport.is_can() => BridgeResponse::Ok,
            BridgeRequest::Connect { .. } => BridgeResponse::Error {
                code: code::CONNECT_FAILED,
                message: "bus init error".into(),
            },
            BridgeRequest::Send { .. } | BridgeRequest::Disconnect => BridgeResponse::Ok,
            BridgeRequest::Receive { .. } => {
                BridgeResponse::Frame(vec![0, 0, 0x07, 0xE8, 0x03, 0x41, 0x0D, 0x32])
            }
            BridgeRequest::ReadVoltage => BridgeResponse::Voltage { millivolts: 12_650 },
            BridgeRequest::Status => BridgeResponse::Status { transport: None },
            BridgeRequest::WriteParameter { .. } => BridgeResponse::Ok,
        }
    }

    #[test]
    fn test_cobs_framing_has_single_delimiter() {
        let bytes = encode(&BridgeRequest::Send {
            frame: vec![0x00, 0x00, 0x07, 0xDF, 0x02, 0x01, 0x00, 0x00],
            timeout_ms: 250,
        })
        .unwrap();
        assert_eq!(bytes.iter().filter(|&&b| b == DELIMITER).count(), 1);
        assert_eq!(bytes.last(), Some(&DELIMITER));
        let mut bytes = bytes;
        assert!(matches!(
            decode::<BridgeRequest>(&mut bytes).unwrap(),
            BridgeRequest::Send { timeout_ms: 250, .. }
        ));

        let mut sequenced = encode(&Envelope {
            seq: 7,
            body: BridgeResponse::Voltage { millivolts: 12_000 },
        })
        .unwrap();
        let reply = decode::<Envelope<BridgeResponse>>(&mut sequenced).unwrap();
        assert_eq!(reply.seq, 7);
        assert_eq!(reply.body, BridgeResponse::Voltage { millivolts: 12_000 });
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let (client, server) = tokio::io::duplex(1024);
        spawn_fake_bridge(server, firmware(true, FirmwareVersion::new(2, 9, 0)));
        let bridge = BridgeAdapter::new(client);

        let caps = bridge.initialize(&AdapterConfig::default()).await.unwrap();
        assert!(caps.supports_tuning);
        assert_eq!(caps.transports.len(), 2);
        assert!(caps.safety_limits.is_some());

        let handle = bridge
            .connect(Transport::Iso15765_4Can11bit500, 0, 500_000)
            .await
            .unwrap();
        bridge
            .send_frame(handle, &[0, 0, 0x07, 0xDF, 0x02, 0x01, 0x0D], Duration::from_millis(100))
            .await
            .unwrap();
        let frame = bridge
            .receive_frame(handle, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(frame[5..7], [0x41, 0x0D]);
        assert_eq!(bridge.read_voltage().await.unwrap(), 12.65);
    }

    #[tokio::test]
    async fn test_old_tuning_firmware_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        spawn_fake_bridge(server, firmware(true, FirmwareVersion::new(2, 8, 4)));
        let bridge = BridgeAdapter::new(client);
        assert!(matches!(
            bridge.initialize(&AdapterConfig::default()).await,
            Err(AdapterError::IncompatibleFirmware { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_transient() {
        let (client, server) = tokio::io::duplex(1024);
        spawn_fake_bridge(server, firmware(false, FirmwareVersion::new(1, 2, 0)));
        let bridge = BridgeAdapter::new(client);
        bridge.initialize(&AdapterConfig::default()).await.unwrap();
        let err = bridge.connect(Transport::Iso9141_2, 0, 10_400).await.unwrap_err();
        assert!(err.is_transient());

        let handle = bridge
            .connect(Transport::Iso15765_4Can11bit500, 0, 500_000)
            .await
            .unwrap();
        assert!(matches!(
            bridge
                .write_parameter(handle, &ControlCommand::new("max_boost", 20.0))
                .await,
            Err(AdapterError::Unsupported(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_discarded() {
        let (client, server) = tokio::io::duplex(1024);
        let mut receives = 0;
        spawn_slow_bridge(
            server,
            firmware(true, FirmwareVersion::new(2, 9, 0)),
            move |request| match request {
                BridgeRequest::Receive { .. } => {
                    receives += 1;
                    if receives == 1 {
                        Duration::from_millis(400)
                    } else {
                        Duration::ZERO
                    }
                }
                _ => Duration::ZERO,
            },
        );
        let bridge = BridgeAdapter::new(client);
        bridge.initialize(&AdapterConfig::default()).await.unwrap();
        let handle = bridge
            .connect(Transport::Iso15765_4Can11bit500, 0, 500_000)
            .await
            .unwrap();

        let first = bridge.receive_frame(handle, Duration::from_millis(10)).await;
        assert!(matches!(first, Err(AdapterError::Timeout { .. })));

        bridge
            .send_frame(handle, &[0, 0, 0x07, 0xDF, 0x02, 0x01, 0x0D], Duration::from_millis(100))
            .await
            .unwrap();
        let frame = bridge
            .receive_frame(handle, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(frame[5..7], [0x41, 0x0D]);
        assert_eq!(bridge.read_voltage().await.unwrap(), 12.65);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_survives_failed_disconnect() {
        let (client, server) = tokio::io::duplex(1024);
        let mut disconnects = 0;
        spawn_slow_bridge(
            server,
            firmware(true, FirmwareVersion::new(2, 9, 0)),
            move |request| match request {
                BridgeRequest::Disconnect => {
                    disconnects += 1;
                    if disconnects == 1 {
                        Duration::from_millis(1500)
                    } else {
                        Duration::ZERO
                    }
                }
                _ => Duration::ZERO,
            },
        );
        let bridge = BridgeAdapter::new(client);
        bridge.initialize(&AdapterConfig::default()).await.unwrap();
        let old = bridge
            .connect(Transport::Iso15765_4Can11bit500, 0, 500_000)
            .await
            .unwrap();

        let handle = bridge
            .connect(Transport::Iso15765_4Can11bit500, 0, 500_000)
            .await
            .unwrap();
        assert_ne!(handle, old);
        assert!(!bridge.is_channel_open(old));
        assert!(bridge.is_channel_open(handle));
        assert_eq!(bridge.read_voltage().await.unwrap(), 12.65);
    }
}
