//! ELM327 Terminal-Command Adapter
//!
//! Drives an ELM327-compatible interface with AT commands over any async
//! byte stream (a `tokio_serial::SerialStream` in production). Replies are
//! read up to the `>` prompt and the hex lines are turned back into frames
//! in the common byte layout.

use crate::adapter::DeviceAdapter;
use crate::capabilities::{AdapterConfig, DeviceCapabilities, DeviceKind, DeviceStatus, FirmwareVersion};
use crate::channel::{ChannelHandle, ChannelSlot};
use crate::error::{AdapterError, AdapterResult};
use async_trait::async_trait;
use obd_protocol::codec::{kline_style, CanFrame, J1850Frame, KLineFrame};
use obd_protocol::{Transport, TransportFamily};
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

const PROMPT: u8 = b'>';
/// Time allowed for a plain AT command
const AT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Echo off, linefeeds off, spaces on, headers on
const INIT_SEQUENCE: [&str; 4] = ["ATE0", "ATL0", "ATS1", "ATH1"];

struct ElmLink<S> {
    stream: BufReader<S>,
    /// Bytes read but not yet consumed up to a prompt
    rx: Vec<u8>,
    /// Last header set with ATSH
    header: Option<Vec<u8>>,
    /// A command went out whose prompt was never read
    unanswered: bool,
}

/// ELM327 adapter over stream `S`
pub struct Elm327Adapter<S> {
    link: Mutex<ElmLink<S>>,
    slot: ChannelSlot,
    pending: SyncMutex<VecDeque<Vec<u8>>>,
    initialized: AtomicBool,
    version: SyncMutex<Option<FirmwareVersion>>,
}

impl<S> Elm327Adapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            link: Mutex::new(ElmLink {
                stream: BufReader::new(stream),
                rx: Vec::new(),
                header: None,
                unanswered: false,
            }),
            slot: ChannelSlot::new(),
            pending: SyncMutex::new(VecDeque::new()),
            initialized: AtomicBool::new(false),
            version: SyncMutex::new(None),
        }
    }

    fn require_initialized(&self) -> AdapterResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(AdapterError::NotInitialized)
        }
    }

    /// Skip the rest of a reply whose read timed out or was cut off
    async fn resync(link: &mut ElmLink<S>) {
        link.rx.clear();
        let drain = link.stream.read_until(PROMPT, &mut link.rx);
        match tokio::time::timeout(AT_TIMEOUT, drain).await {
            Ok(Ok(n)) if n > 0 => debug!("ELM327 discarded {} stale bytes", n),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("ELM327 resync failed: {}", e),
            Err(_) => warn!("ELM327 resync saw no prompt"),
        }
        link.rx.clear();
        link.unanswered = false;
    }

    /// Send one command and return the reply lines, prompt removed
    async fn command(
        link: &mut ElmLink<S>,
        command: &str,
        timeout: Duration,
    ) -> AdapterResult<Vec<String>> {
        if link.unanswered {
            Self::resync(link).await;
        }
        trace!("ELM327 >> {}", command);
        link.unanswered = true;
        link.stream
            .get_mut()
            .write_all(format!("{}\r", command).as_bytes())
            .await?;
        link.stream.get_mut().flush().await?;

        let read = tokio::time::timeout(timeout, link.stream.read_until(PROMPT, &mut link.rx)).await;
        match read {
            Err(_) => {
                return Err(AdapterError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Ok(0)) => return Err(AdapterError::Io("ELM327 stream closed".into())),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
        }
        if link.rx.last() != Some(&PROMPT) {
            return Err(AdapterError::Io("ELM327 stream closed".into()));
        }

        let text = String::from_utf8_lossy(&link.rx[..link.rx.len() - 1]).into_owned();
        link.rx.clear();
        link.unanswered = false;
        let lines: Vec<String> = text
            .split(['\r', '\n'])
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        trace!("ELM327 << {:?}", lines);
        Ok(lines)
    }

    /// AT command that must answer OK
    async fn expect_ok(link: &mut ElmLink<S>, command: &str) -> AdapterResult<()> {
        let lines = Self::command(link, command, AT_TIMEOUT).await?;
        check_reply(&lines)?;
        if lines.iter().any(|line| line.ends_with("OK")) {
            Ok(())
        } else {
            Err(AdapterError::ConnectFailed(format!(
                "{} answered {:?}",
                command, lines
            )))
        }
    }

    async fn set_header(link: &mut ElmLink<S>, header: &[u8]) -> AdapterResult<()> {
        if link.header.as_deref() == Some(header) {
            return Ok(());
        }
        if header.len() == 4 {
            // 29-bit id: priority byte via ATCP, the rest via ATSH
            Self::expect_ok(link, &format!("ATCP{:02X}", header[0])).await?;
            Self::expect_ok(link, &format!("ATSH{}", hex(&header[1..]))).await?;
        } else {
            Self::expect_ok(link, &format!("ATSH{}", hex(header))).await?;
        }
        link.header = Some(header.to_vec());
        Ok(())
    }

    async fn transmit(
        &self,
        transport: Transport,
        frame: &[u8],
        timeout: Duration,
    ) -> AdapterResult<()> {
        // The ELM327 adds header and checksum itself; split them off
        let (header, data) = match transport.family() {
            TransportFamily::Can => {
                let frame = CanFrame::from_bytes(frame).map_err(protocol_to_adapter)?;
                let header = if frame.extended_id {
                    frame.arbitration_id.to_be_bytes().to_vec()
                } else {
                    let id = frame.arbitration_id as u16;
                    id.to_be_bytes().to_vec()
                };
                (header, frame.data)
            }
            TransportFamily::J1850 => {
                let frame = J1850Frame::from_bytes(frame).map_err(protocol_to_adapter)?;
                (vec![frame.priority, frame.target, frame.source], frame.payload)
            }
            TransportFamily::KLine => {
                let frame = KLineFrame::decode(kline_style(transport), frame)
                    .map_err(protocol_to_adapter)?;
                let header: Vec<u8> = frame.header.iter().take(3).copied().collect();
                (header, frame.service_bytes())
            }
        };

        let mut link = self.link.lock().await;
        if transport.is_can() && header.len() == 2 {
            let text = format!("ATSH{:03X}", u16::from_be_bytes([header[0], header[1]]));
            if link.header.as_deref() != Some(&header[..]) {
                Self::expect_ok(&mut link, &text).await?;
                link.header = Some(header);
            }
        } else {
            Self::set_header(&mut link, &header).await?;
        }

        let lines = Self::command(&mut link, &hex(&data), timeout + AT_TIMEOUT).await?;
        check_reply(&lines)?;
        let frames = parse_frames(transport, &lines)?;
        debug!("ELM327 received {} frames", frames.len());
        self.pending.lock().extend(frames);
        Ok(())
    }
}

/// Bytes as contiguous uppercase hex
fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn protocol_to_adapter(err: obd_protocol::ProtocolError) -> AdapterError {
    AdapterError::InvalidConfiguration(format!("unsendable frame: {}", err))
}

/// Map the ELM327 error replies
fn check_reply(lines: &[String]) -> AdapterResult<()> {
    for line in lines {
        let upper = line.to_ascii_uppercase();
        if upper.contains("NO DATA") {
            return Err(AdapterError::NoResponse);
        }
        if upper.contains("UNABLE TO CONNECT")
            || (upper.starts_with("BUS INIT") && upper.contains("ERROR"))
            || upper.contains("CAN ERROR")
            || upper.contains("BUS ERROR")
        {
            return Err(AdapterError::ConnectFailed(line.clone()));
        }
        if upper == "?" {
            return Err(AdapterError::Unsupported("command rejected by ELM327".into()));
        }
        if upper.contains("STOPPED") {
            return Err(AdapterError::Cancelled);
        }
    }
    Ok(())
}

/// Turn reply lines into frames in the common byte layout
pub fn parse_frames(transport: Transport, lines: &[String]) -> AdapterResult<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    for line in lines {
        let upper = line.to_ascii_uppercase();
        if upper.starts_with("SEARCHING") || upper.starts_with("BUS INIT") || upper == "OK" {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let frame = match transport.family() {
            TransportFamily::Can if !transport.is_extended_id() => {
                let id = u32::from_str_radix(tokens[0], 16)
                    .map_err(|_| malformed(line))?;
                let mut frame = id.to_be_bytes().to_vec();
                frame.extend(parse_hex_tokens(&tokens[1..]).ok_or_else(|| malformed(line))?);
                frame
            }
            TransportFamily::Can => {
                if tokens.len() < 4 {
                    return Err(malformed(line));
                }
                parse_hex_tokens(&tokens).ok_or_else(|| malformed(line))?
            }
            TransportFamily::J1850 => {
                let mut bytes = parse_hex_tokens(&tokens).ok_or_else(|| malformed(line))?;
                // CRC shown with headers on; the codec has no use for it
                bytes.pop();
                bytes
            }
            TransportFamily::KLine => parse_hex_tokens(&tokens).ok_or_else(|| malformed(line))?,
        };
        frames.push(frame);
    }
    Ok(frames)
}

fn parse_hex_tokens(tokens: &[&str]) -> Option<Vec<u8>> {
    tokens
        .iter()
        .map(|t| u8::from_str_radix(t, 16).ok())
        .collect()
}

fn malformed(line: &str) -> AdapterError {
    AdapterError::Io(format!("unparseable ELM327 line: {}", line))
}

/// Version from an `ATZ`/`ATI` banner such as "ELM327 v1.5"
fn banner_version(lines: &[String]) -> Option<FirmwareVersion> {
    lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .find(|token| token.starts_with(['v', 'V']))
        .and_then(|token| token.parse().ok())
}

#[async_trait]
impl<S> DeviceAdapter for Elm327Adapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> DeviceKind {
        DeviceKind::Elm327
    }

    async fn initialize(&self, config: &AdapterConfig) -> AdapterResult<DeviceCapabilities> {
        let mut link = self.link.lock().await;
        let timeout = Duration::from_millis(config.init_timeout_ms);

        let banner = Self::command(&mut link, "ATZ", timeout)
            .await
            .map_err(|e| AdapterError::InitializationFailed(format!("ATZ: {}", e)))?;
        let version = banner_version(&banner);
        info!("ELM327 reset: {:?}", banner);

        for command in INIT_SEQUENCE {
            Self::expect_ok(&mut link, command)
                .await
                .map_err(|e| AdapterError::InitializationFailed(format!("{}: {}", command, e)))?;
        }
        link.header = None;

        *self.version.lock() = version;
        self.initialized.store(true, Ordering::Release);
        Ok(DeviceCapabilities {
            kind: DeviceKind::Elm327,
            transports: Transport::ALL.to_vec(),
            max_sample_rate_hz: 10,
            multi_bus: false,
            safety_limits: None,
            firmware_version: version,
            supports_tuning: false,
        })
    }

    async fn connect(
        &self,
        transport: Transport,
        _flags: u32,
        _baud_rate: u32,
    ) -> AdapterResult<ChannelHandle> {
        self.require_initialized()?;
        if let Some(old) = self.slot.close_any() {
            debug!("ELM327 closing {} before reconnect", old);
        }
        self.pending.lock().clear();

        let mut link = self.link.lock().await;
        if let Err(e) = Self::expect_ok(&mut link, "ATPC").await {
            warn!("ELM327 protocol close before {} failed: {}", transport, e);
        }
        Self::expect_ok(&mut link, transport.to_elm_command()).await?;
        if transport.is_can() {
            // Raw ISO-TP: PCI bytes visible, flow control sent by the host
            Self::expect_ok(&mut link, "ATCAF0").await?;
            Self::expect_ok(&mut link, "ATCFC0").await?;
        }
        link.header = None;
        drop(link);

        let handle = self.slot.open(transport);
        info!("ELM327 connected {} on {}", handle, transport);
        Ok(handle)
    }

    async fn disconnect(&self, handle: ChannelHandle) -> AdapterResult<()> {
        self.slot.close(handle)?;
        self.pending.lock().clear();
        let mut link = self.link.lock().await;
        if let Err(e) = Self::expect_ok(&mut link, "ATPC").await {
            warn!("ELM327 protocol close failed: {}", e);
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
        self.slot
            .with_cancel(handle, self.transmit(transport, frame, timeout))
            .await
    }

    async fn receive_frame(
        &self,
        handle: ChannelHandle,
        _timeout: Duration,
    ) -> AdapterResult<Vec<u8>> {
        self.slot.check(handle)?;
        // The reply to the last command was read in full
        self.pending.lock().pop_front().ok_or(AdapterError::NoResponse)
    }

    async fn read_voltage(&self) -> AdapterResult<f64> {
        self.require_initialized()?;
        let mut link = self.link.lock().await;
        let lines = Self::command(&mut link, "ATRV", AT_TIMEOUT).await?;
        check_reply(&lines)?;
        lines
            .iter()
            .find_map(|line| line.trim_end_matches(['V', 'v']).parse::<f64>().ok())
            .ok_or_else(|| AdapterError::Io(format!("unexpected ATRV reply {:?}", lines)))
    }

    async fn read_status(&self) -> AdapterResult<DeviceStatus> {
        self.require_initialized()?;
        let mut link = self.link.lock().await;
        let ident = Self::command(&mut link, "ATI", AT_TIMEOUT).await?;
        let protocol = Self::command(&mut link, "ATDPN", AT_TIMEOUT).await?;
        drop(link);

        // "A6" means automatic, currently 6
        let active_transport = protocol
            .first()
            .map(|p| p.trim_start_matches(['A', 'a']))
            .and_then(|p| u8::from_str_radix(p, 16).ok())
            .and_then(Transport::from_elm_protocol_number);
        let voltage = self.read_voltage().await.ok();

        Ok(DeviceStatus {
            kind: DeviceKind::Elm327,
            firmware_version: *self.version.lock(),
            description: ident.join(" "),
            voltage,
            active_transport,
            channel_open: self.slot.handle().is_some(),
        })
    }

    fn is_channel_open(&self, handle: ChannelHandle) -> bool {
        self.slot.is_open(handle)
    }

    async fn shutdown(&self) -> AdapterResult<()> {
        if let Some(handle) = self.slot.handle() {
            self.disconnect(handle).await?;
        }
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }
}
