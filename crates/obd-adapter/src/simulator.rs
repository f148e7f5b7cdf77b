//! Virtual Vehicle Simulator
//!
//! An in-process ECU that decodes requests with the real codecs and answers
//! on the configured transports. Multi-frame CAN answers hold their
//! consecutive frames until the tester sends Flow Control. Faults can be
//! injected to exercise retry and error paths without hardware.

use crate::adapter::DeviceAdapter;
use crate::capabilities::{
    check_tuning_compatibility, AdapterConfig, DeviceCapabilities, DeviceKind, DeviceStatus,
    FirmwareVersion,
};
use crate::channel::{ChannelHandle, ChannelSlot};
use crate::error::{AdapterError, AdapterResult};
use async_trait::async_trait;
use obd_protocol::codec::{
    can, isotp, kline_style, kwp, CanFrame, IsoTpFrame, J1850Frame, KLineFrame, KLineStyle,
    Reassembler, Reassembly,
};
use obd_protocol::{is_support_pid, mode, Transport, TransportFamily};
use parking_lot::Mutex;
use safety_validator::{ControlCommand, SafetyLimits};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Negative response code: sub-function not supported
const NRC_NOT_SUPPORTED: u8 = 0x12;
/// Negative response code: service not supported
const NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;
/// Negative response code: conditions not correct
const NRC_CONDITIONS_NOT_CORRECT: u8 = 0x22;
/// ECU address used in J1850 and K-line answers
const ECU_ADDRESS: u8 = 0x10;
/// Pending bit of a DTC status byte
const STATUS_PENDING: u8 = 0x04;
/// Codes per Mode 03 message on J1850 and K-line
const CODES_PER_FRAME: usize = 3;

/// A stored trouble code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDtc {
    pub raw_code: u16,
    pub status: u8,
}

/// Snapshot stored with a trouble code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedFreezeFrame {
    pub dtc: u16,
    /// Raw data bytes per PID
    pub pids: BTreeMap<u8, Vec<u8>>,
}

/// Vehicle behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Transports the vehicle answers on
    pub transports: Vec<Transport>,
    /// Raw Mode 01 data bytes per PID
    pub pids: BTreeMap<u8, Vec<u8>>,
    pub dtcs: Vec<SimulatedDtc>,
    pub freeze_frame: Option<SimulatedFreezeFrame>,
    /// Whether Mode 04 is accepted
    pub clear_succeeds: bool,
    pub voltage: f64,
    pub firmware: FirmwareVersion,
    pub supports_tuning: bool,
    /// Limits the virtual device reports about itself
    pub safety_limits: Option<SafetyLimits>,
    pub response_delay_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        let pids = BTreeMap::from([
            (0x04, vec![0x66]),
            (0x05, vec![0x7B]),
            (0x0B, vec![0x21]),
            (0x0C, vec![0x1A, 0xF8]),
            (0x0D, vec![0x32]),
            (0x0F, vec![0x44]),
            (0x10, vec![0x01, 0xF4]),
            (0x11, vec![0x33]),
            (0x2F, vec![0xA0]),
            (0x42, vec![0x31, 0x2D]),
        ]);
        let freeze_pids = BTreeMap::from([
            (0x04, vec![0x99]),
            (0x05, vec![0x85]),
            (0x0C, vec![0x2E, 0xE0]),
            (0x0D, vec![0x46]),
        ]);
        Self {
            transports: vec![Transport::Iso15765_4Can11bit500],
            pids,
            dtcs: vec![
                SimulatedDtc {
                    raw_code: 0x0123,
                    status: 0x08,
                },
                SimulatedDtc {
                    raw_code: 0x0420,
                    status: 0x0C,
                },
            ],
            freeze_frame: Some(SimulatedFreezeFrame {
                dtc: 0x0123,
                pids: freeze_pids,
            }),
            clear_succeeds: true,
            voltage: 12.6,
            firmware: FirmwareVersion::new(2, 9, 1),
            supports_tuning: true,
            safety_limits: None,
            response_delay_ms: 0,
        }
    }
}

/// Injected misbehaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    /// Swallow the next N requests
    DropResponses(u32),
    /// Flip the checksum of the next N K-line answers
    CorruptChecksum(u32),
    /// Skip a consecutive frame in the next N multi-frame CAN answers
    BreakSequence(u32),
    /// Answer every request with `7F <mode> <nrc>`
    NegativeResponse(u8),
}

#[derive(Debug, Default)]
struct SimState {
    initialized: bool,
    /// Frames ready for the tester
    outbox: VecDeque<Vec<u8>>,
    /// Consecutive frames waiting for Flow Control
    held: VecDeque<Vec<u8>>,
    /// Multi-frame request in progress
    inbound: Reassembler,
    dtcs: Vec<SimulatedDtc>,
    freeze_frame: Option<SimulatedFreezeFrame>,
    faults: Vec<Fault>,
    sent: Vec<Vec<u8>>,
    written: Vec<ControlCommand>,
}

struct SimInner {
    config: SimulatorConfig,
    state: Mutex<SimState>,
    slot: ChannelSlot,
}

/// Simulated device. Clones share the same vehicle, so a test can keep a
/// handle for inspection after giving one to a client.
#[derive(Clone)]
pub struct Simulator {
    inner: Arc<SimInner>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let state = SimState {
            dtcs: config.dtcs.clone(),
            freeze_frame: config.freeze_frame.clone(),
            ..Default::default()
        };
        Self {
            inner: Arc::new(SimInner {
                config,
                state: Mutex::new(state),
                slot: ChannelSlot::new(),
            }),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.inner.config
    }

    pub fn inject_fault(&self, fault: Fault) {
        debug!("Simulator fault injected: {:?}", fault);
        self.inner.state.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.inner.state.lock().faults.clear();
    }

    /// Every frame the tester sent, in order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().sent.clone()
    }

    /// Control commands accepted by the virtual device
    pub fn written_parameters(&self) -> Vec<ControlCommand> {
        self.inner.state.lock().written.clone()
    }

    /// Stored trouble codes as currently held by the vehicle
    pub fn stored_dtcs(&self) -> Vec<SimulatedDtc> {
        self.inner.state.lock().dtcs.clone()
    }

    fn require_initialized(&self) -> AdapterResult<()> {
        if self.inner.state.lock().initialized {
            Ok(())
        } else {
            Err(AdapterError::NotInitialized)
        }
    }

    fn answers_on(&self, transport: Transport) -> bool {
        self.inner.config.transports.contains(&transport)
    }

    /// Handle one tester frame, queueing whatever the vehicle answers
    fn on_frame(&self, transport: Transport, frame: &[u8]) {
        let mut state = self.inner.state.lock();
        state.sent.push(frame.to_vec());
        if !self.answers_on(transport) {
            trace!("Simulator silent on {}", transport);
            return;
        }

        let request = match transport.family() {
            TransportFamily::Can => match self.on_can_frame(&mut state, transport, frame) {
                Some(request) => request,
                None => return,
            },
            TransportFamily::J1850 => match J1850Frame::from_bytes(frame) {
                Ok(frame) => frame.payload,
                Err(e) => {
                    debug!("Simulator ignoring J1850 frame: {}", e);
                    return;
                }
            },
            TransportFamily::KLine => match KLineFrame::decode(kline_style(transport), frame) {
                Ok(frame) => frame.service_bytes(),
                Err(e) => {
                    debug!("Simulator ignoring K-line frame: {}", e);
                    return;
                }
            },
        };

        if take_counted(&mut state.faults, |f| matches!(f, Fault::DropResponses(_))) {
            debug!("Simulator dropping response to {:02X?}", request);
            return;
        }

        let nrc = state.faults.iter().find_map(|f| match f {
            Fault::NegativeResponse(nrc) => Some(*nrc),
            _ => None,
        });
        let answers = match nrc {
            Some(nrc) => vec![negative(request.first().copied().unwrap_or(0), nrc)],
            None => self.answer(&mut state, transport, &request),
        };
        for answer in answers {
            self.emit(&mut state, transport, &answer);
        }
    }

    /// Returns a complete request once every segment has arrived
    fn on_can_frame(
        &self,
        state: &mut SimState,
        transport: Transport,
        frame: &[u8],
    ) -> Option<Vec<u8>> {
        let frame = CanFrame::from_bytes(frame).ok()?;
        let extended = transport.is_extended_id();
        let physical = can::physical_request_id(can::response_id(extended, 0));
        if frame.arbitration_id != can::functional_request_id(extended)
            && Some(frame.arbitration_id) != physical
        {
            return None;
        }

        match IsoTpFrame::parse(&frame.data).ok()? {
            IsoTpFrame::FlowControl { status, .. } => {
                match status {
                    isotp::FlowStatus::ContinueToSend => {
                        let held: Vec<_> = state.held.drain(..).collect();
                        state.outbox.extend(held);
                    }
                    isotp::FlowStatus::Wait => {}
                    isotp::FlowStatus::Overflow => state.held.clear(),
                }
                None
            }
            pdu => match state.inbound.push(pdu) {
                Ok(Reassembly::Complete(request)) => Some(request),
                Ok(Reassembly::NeedFlowControl) => {
                    let id = can::response_id(extended, 0);
                    if let Ok(fc) = CanFrame::padded(id, IsoTpFrame::clear_to_send().to_bytes()) {
                        state.outbox.push_back(fc.to_bytes());
                    }
                    None
                }
                Ok(Reassembly::InProgress) => None,
                Err(e) => {
                    debug!("Simulator dropped malformed request: {}", e);
                    None
                }
            },
        }
    }

    /// Service responses for one request, service id first
    fn answer(&self, state: &mut SimState, transport: Transport, request: &[u8]) -> Vec<Vec<u8>> {
        let Some((&service, args)) = request.split_first() else {
            return Vec::new();
        };
        let positive = service.wrapping_add(mode::RESPONSE_OFFSET);

        match service {
            mode::CURRENT_DATA => {
                let Some(&pid) = args.first() else {
                    return vec![negative(service, NRC_NOT_SUPPORTED)];
                };
                let pids = &self.inner.config.pids;
                if is_support_pid(pid) {
                    if pid == 0 || pids.keys().any(|&p| p > pid) {
                        let mut out = vec![positive, pid];
                        out.extend_from_slice(&support_bitmap(pid, pids.keys().copied()));
                        return vec![out];
                    }
                    return vec![negative(service, NRC_NOT_SUPPORTED)];
                }
                match pids.get(&pid) {
                    Some(data) => {
                        let mut out = vec![positive, pid];
                        out.extend_from_slice(data);
                        vec![out]
                    }
                    None => vec![negative(service, NRC_NOT_SUPPORTED)],
                }
            }
            mode::FREEZE_FRAME => {
                let Some(&pid) = args.first() else {
                    return vec![negative(service, NRC_NOT_SUPPORTED)];
                };
                let frame = args.get(1).copied().unwrap_or(0);
                let Some(stored) = state.freeze_frame.as_ref() else {
                    if pid == 0x02 {
                        return vec![vec![positive, pid, frame, 0x00, 0x00]];
                    }
                    return vec![negative(service, NRC_NOT_SUPPORTED)];
                };
                if pid == 0x02 {
                    let [hi, lo] = stored.dtc.to_be_bytes();
                    return vec![vec![positive, pid, frame, hi, lo]];
                }
                if is_support_pid(pid) {
                    let keys = stored.pids.keys().copied().chain(std::iter::once(0x02));
                    let mut out = vec![positive, pid, frame];
                    out.extend_from_slice(&support_bitmap(pid, keys));
                    return vec![out];
                }
                match stored.pids.get(&pid) {
                    Some(data) => {
                        let mut out = vec![positive, pid, frame];
                        out.extend_from_slice(data);
                        vec![out]
                    }
                    None => vec![negative(service, NRC_NOT_SUPPORTED)],
                }
            }
            mode::READ_DTC => dtc_answers(transport, positive, state.dtcs.iter().map(|d| d.raw_code)),
            mode::PENDING_DTC => match args.first() {
                // Status query for one stored code
                Some(&low) => match state.dtcs.iter().find(|d| d.raw_code as u8 == low) {
                    Some(dtc) => vec![vec![positive, low, dtc.status]],
                    None => vec![negative(service, NRC_NOT_SUPPORTED)],
                },
                None => dtc_answers(
                    transport,
                    positive,
                    state
                        .dtcs
                        .iter()
                        .filter(|d| d.status & STATUS_PENDING != 0)
                        .map(|d| d.raw_code),
                ),
            },
            mode::PERMANENT_DTC => dtc_answers(transport, positive, std::iter::empty()),
            mode::CLEAR_DTC => {
                if self.inner.config.clear_succeeds {
                    info!("Simulator cleared {} trouble codes", state.dtcs.len());
                    state.dtcs.clear();
                    state.freeze_frame = None;
                    vec![vec![positive]]
                } else {
                    vec![negative(service, NRC_CONDITIONS_NOT_CORRECT)]
                }
            }
            _ => vec![negative(service, NRC_SERVICE_NOT_SUPPORTED)],
        }
    }

    /// Frame a service response for the wire and queue it
    fn emit(&self, state: &mut SimState, transport: Transport, service: &[u8]) {
        match transport.family() {
            TransportFamily::Can => {
                let id = can::response_id(transport.is_extended_id(), 0);
                let Ok(segments) = isotp::segment(service) else {
                    return;
                };
                let mut frames: VecDeque<Vec<u8>> = segments
                    .into_iter()
                    .filter_map(|pdu| CanFrame::padded(id, pdu.to_bytes()).ok())
                    .map(|frame| frame.to_bytes())
                    .collect();
                let Some(first) = frames.pop_front() else {
                    return;
                };
                state.outbox.push_back(first);
                if !frames.is_empty()
                    && take_counted(&mut state.faults, |f| matches!(f, Fault::BreakSequence(_)))
                {
                    debug!("Simulator breaking ISO-TP sequence");
                    frames.pop_front();
                }
                state.held.extend(frames);
            }
            TransportFamily::J1850 => {
                let priority = if transport == Transport::J1850Pwm { 0x41 } else { 0x48 };
                let mut out = vec![priority, 0x6B, ECU_ADDRESS];
                out.extend_from_slice(service);
                state.outbox.push_back(out);
            }
            TransportFamily::KLine => {
                let mut out = match kline_style(transport) {
                    KLineStyle::Iso9141 => vec![0x48, 0x6B, ECU_ADDRESS],
                    KLineStyle::Kwp2000 => vec![0x80 | service.len() as u8, 0xF1, ECU_ADDRESS],
                };
                out.extend_from_slice(service);
                let mut sum = kwp::checksum(&out);
                if take_counted(&mut state.faults, |f| matches!(f, Fault::CorruptChecksum(_))) {
                    debug!("Simulator corrupting checksum");
                    sum = sum.wrapping_add(1);
                }
                out.push(sum);
                state.outbox.push_back(out);
            }
        }
    }
}

fn negative(service: u8, nrc: u8) -> Vec<u8> {
    vec![mode::NEGATIVE_RESPONSE, service, nrc]
}

/// Four-byte bitmap of the PIDs in `base + 1 ..= base + 0x20`
fn support_bitmap(base: u8, pids: impl Iterator<Item = u8> + Clone) -> [u8; 4] {
    let mut bits: u32 = 0;
    for pid in pids.clone() {
        if pid > base && (pid as u32) <= base as u32 + 0x20 {
            bits |= 1 << (0x20 - (pid - base) as u32);
        }
    }
    // Next page supported
    if pids.into_iter().any(|p| p as u32 > base as u32 + 0x20) {
        bits |= 1;
    }
    bits.to_be_bytes()
}

/// Mode 03/07/0A answers. CAN carries a count byte and one message, so at
/// most 255 codes; the older buses carry three codes per message, zero
/// padded.
fn dtc_answers(transport: Transport, positive: u8, codes: impl Iterator<Item = u16>) -> Vec<Vec<u8>> {
    let codes: Vec<u16> = codes.collect();
    if transport.is_can() {
        let count = u8::try_from(codes.len()).unwrap_or(u8::MAX);
        let mut out = vec![positive, count];
        for code in codes.iter().take(count as usize) {
            out.extend_from_slice(&code.to_be_bytes());
        }
        return vec![out];
    }
    if codes.is_empty() {
        let mut out = vec![positive];
        out.extend_from_slice(&[0; CODES_PER_FRAME * 2]);
        return vec![out];
    }
    codes
        .chunks(CODES_PER_FRAME)
        .map(|chunk| {
            let mut out = vec![positive];
            for i in 0..CODES_PER_FRAME {
                let code = chunk.get(i).copied().unwrap_or(0);
                out.extend_from_slice(&code.to_be_bytes());
            }
            out
        })
        .collect()
}

/// Consume one use of the first counted fault matching `is_kind`
fn take_counted(faults: &mut Vec<Fault>, is_kind: impl Fn(&Fault) -> bool) -> bool {
    let Some(index) = faults.iter().position(|f| is_kind(f)) else {
        return false;
    };
    let remaining = match faults[index] {
        Fault::DropResponses(n) | Fault::CorruptChecksum(n) | Fault::BreakSequence(n) => n,
        Fault::NegativeResponse(_) => return true,
    };
    if remaining <= 1 {
        faults.remove(index);
    } else if let Fault::DropResponses(n) | Fault::CorruptChecksum(n) | Fault::BreakSequence(n) =
        &mut faults[index]
    {
        *n -= 1;
    }
    remaining > 0
}

#[async_trait]
impl DeviceAdapter for Simulator {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Simulator
    }

    async fn initialize(&self, _config: &AdapterConfig) -> AdapterResult<DeviceCapabilities> {
        let config = &self.inner.config;
        if config.supports_tuning {
            check_tuning_compatibility(config.firmware)?;
        }
        self.inner.state.lock().initialized = true;
        info!(
            "Simulator initialized, vehicle answers on {:?}",
            config.transports
        );
        Ok(DeviceCapabilities {
            kind: DeviceKind::Simulator,
            transports: Transport::ALL.to_vec(),
            max_sample_rate_hz: 100,
            multi_bus: false,
            safety_limits: config.safety_limits.clone(),
            firmware_version: Some(config.firmware),
            supports_tuning: config.supports_tuning,
        })
    }

    async fn connect(
        &self,
        transport: Transport,
        _flags: u32,
        _baud_rate: u32,
    ) -> AdapterResult<ChannelHandle> {
        self.require_initialized()?;
        if let Some(old) = self.inner.slot.close_any() {
            debug!("Simulator closing {} before reconnect", old);
        }
        {
            let mut state = self.inner.state.lock();
            state.outbox.clear();
            state.held.clear();
            state.inbound.reset();
        }
        let handle = self.inner.slot.open(transport);
        debug!("Simulator connected {} on {}", handle, transport);
        Ok(handle)
    }

    async fn disconnect(&self, handle: ChannelHandle) -> AdapterResult<()> {
        self.inner.slot.close(handle)?;
        let mut state = self.inner.state.lock();
        state.outbox.clear();
        state.held.clear();
        Ok(())
    }

    async fn send_frame(
        &self,
        handle: ChannelHandle,
        frame: &[u8],
        _timeout: Duration,
    ) -> AdapterResult<()> {
        let transport = self.inner.slot.check(handle)?;
        trace!("Simulator rx {:02X?}", frame);
        self.on_frame(transport, frame);
        Ok(())
    }

    async fn receive_frame(
        &self,
        handle: ChannelHandle,
        timeout: Duration,
    ) -> AdapterResult<Vec<u8>> {
        self.inner.slot.check(handle)?;
        let delay = Duration::from_millis(self.inner.config.response_delay_ms);
        self.inner
            .slot
            .with_cancel(handle, async {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                } else {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let next = self.inner.state.lock().outbox.pop_front();
                    if let Some(frame) = next {
                        return Ok(frame);
                    }
                    tokio::time::sleep(timeout - delay).await;
                }
                Err(AdapterError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            })
            .await
    }

    async fn read_voltage(&self) -> AdapterResult<f64> {
        self.require_initialized()?;
        Ok(self.inner.config.voltage)
    }

    async fn read_status(&self) -> AdapterResult<DeviceStatus> {
        self.require_initialized()?;
        let transport = self.inner.slot.transport();
        Ok(DeviceStatus {
            kind: DeviceKind::Simulator,
            firmware_version: Some(self.inner.config.firmware),
            description: "Virtual vehicle simulator".to_string(),
            voltage: Some(self.inner.config.voltage),
            active_transport: transport,
            channel_open: transport.is_some(),
        })
    }

    fn is_channel_open(&self, handle: ChannelHandle) -> bool {
        self.inner.slot.is_open(handle)
    }

    async fn write_parameter(
        &self,
        handle: ChannelHandle,
        command: &ControlCommand,
    ) -> AdapterResult<()> {
        if !self.inner.config.supports_tuning {
            return Err(AdapterError::Unsupported(format!(
                "simulator cannot write {}",
                command.parameter
            )));
        }
        self.inner.slot.check(handle)?;
        info!(
            "Simulator accepted {} = {}",
            command.parameter, command.value
        );
        self.inner.state.lock().written.push(command.clone());
        Ok(())
    }

    async fn shutdown(&self) -> AdapterResult<()> {
        self.inner.slot.close_any();
        self.inner.state.lock().initialized = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::codec::encode_request;

    const T: Duration = Duration::from_millis(50);

    async fn connected(config: SimulatorConfig, transport: Transport) -> (Simulator, ChannelHandle) {
        let sim = Simulator::new(config);
        sim.initialize(&AdapterConfig::default()).await.unwrap();
        let handle = sim
            .connect(transport, transport.connect_flags(), transport.bus_baud_rate())
            .await
            .unwrap();
        (sim, handle)
    }

    async fn send_service(sim: &Simulator, handle: ChannelHandle, transport: Transport, payload: &[u8]) {
        for frame in encode_request(transport, payload).unwrap() {
            sim.send_frame(handle, &frame.to_bytes(), T).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_requires_initialize() {
        let sim = Simulator::default();
        assert_eq!(
            sim.connect(Transport::Iso15765_4Can11bit500, 0, 500_000).await,
            Err(AdapterError::NotInitialized)
        );
    }

    #[tokio::test]
    async fn test_can_rpm_answer() {
        let transport = Transport::Iso15765_4Can11bit500;
        let (sim, handle) = connected(SimulatorConfig::default(), transport).await;
        send_service(&sim, handle, transport, &[0x01, 0x0C]).await;
        let frame = sim.receive_frame(handle, T).await.unwrap();
        assert_eq!(&frame[..4], &[0x00, 0x00, 0x07, 0xE8]);
        assert_eq!(&frame[4..9], &[0x04, 0x41, 0x0C, 0x1A, 0xF8]);
    }

    #[tokio::test]
    async fn test_support_bitmap() {
        let bitmap = support_bitmap(0x00, [0x01u8, 0x0C, 0x20, 0x42].into_iter());
        // 0x01 -> bit 31, 0x0C -> bit 20, 0x20 -> bit 0 and next page
        assert_eq!(u32::from_be_bytes(bitmap), 0x8010_0001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_on_other_transports() {
        let transport = Transport::Iso9141_2;
        let (sim, handle) = connected(SimulatorConfig::default(), transport).await;
        send_service(&sim, handle, transport, &[0x01, 0x00]).await;
        assert!(matches!(
            sim.receive_frame(handle, T).await,
            Err(AdapterError::Timeout { .. })
        ));
        assert_eq!(sim.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_kline_answer_has_valid_checksum() {
        let transport = Transport::Iso9141_2;
        let config = SimulatorConfig {
            transports: vec![transport],
            ..Default::default()
        };
        let (sim, handle) = connected(config, transport).await;
        send_service(&sim, handle, transport, &[0x01, 0x0D]).await;
        let frame = sim.receive_frame(handle, T).await.unwrap();
        assert_eq!(&frame[..6], &[0x48, 0x6B, 0x10, 0x41, 0x0D, 0x32]);
        assert!(kwp::verify_checksum(&frame).is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_checksum_fault() {
        let transport = Transport::Iso14230_4KwpFast;
        let config = SimulatorConfig {
            transports: vec![transport],
            ..Default::default()
        };
        let (sim, handle) = connected(config, transport).await;
        sim.inject_fault(Fault::CorruptChecksum(1));
        send_service(&sim, handle, transport, &[0x01, 0x0D]).await;
        let bad = sim.receive_frame(handle, T).await.unwrap();
        assert!(kwp::verify_checksum(&bad).is_err());
        send_service(&sim, handle, transport, &[0x01, 0x0D]).await;
        let good = sim.receive_frame(handle, T).await.unwrap();
        assert!(kwp::verify_checksum(&good).is_ok());
    }

    #[tokio::test]
    async fn test_multi_frame_waits_for_flow_control() {
        let transport = Transport::Iso15765_4Can11bit500;
        let config = SimulatorConfig {
            dtcs: (1..=5)
                .map(|i| SimulatedDtc {
                    raw_code: 0x0100 + i,
                    status: 0x08,
                })
                .collect(),
            ..Default::default()
        };
        let (sim, handle) = connected(config, transport).await;
        send_service(&sim, handle, transport, &[0x03]).await;

        let first = sim.receive_frame(handle, T).await.unwrap();
        assert_eq!(first[4] & 0xF0, 0x10);
        // Nothing more until Flow Control
        assert!(sim.receive_frame(handle, T).await.is_err());

        let fc = CanFrame::padded(0x7E0, IsoTpFrame::clear_to_send().to_bytes()).unwrap();
        sim.send_frame(handle, &fc.to_bytes(), T).await.unwrap();
        let second = sim.receive_frame(handle, T).await.unwrap();
        assert_eq!(second[4], 0x21);
    }

    #[tokio::test]
    async fn test_drop_and_negative_faults() {
        let transport = Transport::Iso15765_4Can11bit500;
        let (sim, handle) = connected(SimulatorConfig::default(), transport).await;
        sim.inject_fault(Fault::DropResponses(1));
        send_service(&sim, handle, transport, &[0x01, 0x0C]).await;
        assert!(sim.receive_frame(handle, T).await.is_err());

        sim.inject_fault(Fault::NegativeResponse(0x31));
        send_service(&sim, handle, transport, &[0x01, 0x0C]).await;
        let frame = sim.receive_frame(handle, T).await.unwrap();
        assert_eq!(&frame[4..8], &[0x03, 0x7F, 0x01, 0x31]);
    }

    #[tokio::test]
    async fn test_dtc_status_and_clear() {
        let transport = Transport::Iso15765_4Can11bit500;
        let (sim, handle) = connected(SimulatorConfig::default(), transport).await;
        send_service(&sim, handle, transport, &[0x07, 0x23]).await;
        let frame = sim.receive_frame(handle, T).await.unwrap();
        assert_eq!(&frame[4..8], &[0x03, 0x47, 0x23, 0x08]);

        send_service(&sim, handle, transport, &[0x04]).await;
        let frame = sim.receive_frame(handle, T).await.unwrap();
        assert_eq!(&frame[4..6], &[0x01, 0x44]);
        assert!(sim.stored_dtcs().is_empty());
    }

    #[tokio::test]
    async fn test_kline_dtcs_three_per_frame() {
        let answers = dtc_answers(
            Transport::Iso9141_2,
            0x43,
            [0x0123u16, 0x0420, 0x0300, 0x4100].into_iter(),
        );
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0], vec![0x43, 0x01, 0x23, 0x04, 0x20, 0x03, 0x00]);
        assert_eq!(answers[1], vec![0x43, 0x41, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn test_can_dtc_count_saturates() {
        let answers = dtc_answers(Transport::Iso15765_4Can11bit500, 0x43, 1..=300u16);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0][1], 0xFF);
        assert_eq!(answers[0].len(), 2 + 255 * 2);
        assert_eq!(&answers[0][510..], &[0x00, 0xFF]);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_receive() {
        let transport = Transport::Iso15765_4Can11bit500;
        let (sim, handle) = connected(SimulatorConfig::default(), transport).await;
        let waiter = {
            let sim = sim.clone();
            tokio::spawn(async move { sim.receive_frame(handle, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sim.disconnect(handle).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Err(AdapterError::Cancelled));
    }

    #[tokio::test]
    async fn test_write_parameter_recorded() {
        let transport = Transport::Iso15765_4Can11bit500;
        let (sim, handle) = connected(SimulatorConfig::default(), transport).await;
        sim.write_parameter(handle, &ControlCommand::new("max_boost", 22.0))
            .await
            .unwrap();
        assert_eq!(sim.written_parameters().len(), 1);
    }
}
