//! Request/Response Engine
//!
//! Encodes a request for the active transport, sends it, collects and
//! decodes the answer. Transport failures are retried with exponential
//! backoff, reopening the channel when the adapter reports it closed.
//! Decoding failures are returned at once.

use crate::error::{ObdError, ObdResult};
use obd_adapter::{AdapterError, ChannelHandle, DeviceAdapter};
use obd_protocol::codec::{
    can, encode_request, isotp, kline_style, CanFrame, FlowStatus, IsoTpFrame, J1850Frame,
    KLineFrame, Reassembler, Reassembly, TransportFrame,
};
use obd_protocol::{mode, ParameterRequest, ParameterResponse, ProtocolError, Transport, TransportFamily};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// NRC 0x78: request received, response pending
const NRC_RESPONSE_PENDING: u8 = 0x78;
/// Upper bound on frames read while clearing a channel
const MAX_DRAIN_FRAMES: usize = 64;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(5);
/// Flow Control Wait frames tolerated per block (ISO 15765-2 N_WFTmax)
const MAX_FLOW_WAITS: usize = 10;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// First retry delay; doubles on every further retry
    pub retry_backoff_ms: u64,
    /// Response timeout; the transport default when unset
    pub timeout_ms: Option<u64>,
    /// Consecutive failed requests before re-negotiation is advised
    pub renegotiate_after: u32,
    /// Most frames accepted for one multi-frame answer
    pub max_response_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 50,
            timeout_ms: None,
            renegotiate_after: 5,
            max_response_frames: 32,
        }
    }
}

impl EngineConfig {
    fn timeout(&self, transport: Transport) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| transport.default_timeout())
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Request statistics for the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStatistics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub checksum_errors: u64,
    pub negative_responses: u64,
    pub reconnects: u64,
    /// Sum of successful response times
    pub total_response_ms: u64,
}

impl RequestStatistics {
    pub fn average_response_ms(&self) -> f64 {
        if self.successes == 0 {
            0.0
        } else {
            self.total_response_ms as f64 / self.successes as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

/// Closes the engine's current channel from another task, without waiting
/// for the request in flight. Its receive fails with
/// [`AdapterError::Cancelled`].
#[derive(Clone)]
pub struct ChannelCloser {
    adapter: Arc<dyn DeviceAdapter>,
    link: Arc<SyncMutex<Option<Link>>>,
}

impl ChannelCloser {
    pub async fn close(&self) -> Result<(), AdapterError> {
        let handle = self.handle().ok_or(AdapterError::ChannelClosed)?;
        info!("Closing {} on request", handle);
        self.adapter.disconnect(handle).await
    }

    /// Channel a `close` would target right now
    pub fn handle(&self) -> Option<ChannelHandle> {
        self.link.lock().as_ref().map(|l| l.handle)
    }
}

/// Frames read without getting closer to an answer
struct IdleFrames {
    seen: usize,
    limit: usize,
    timeout: Duration,
}

impl IdleFrames {
    fn new(limit: usize, timeout: Duration) -> Self {
        Self {
            seen: 0,
            limit,
            timeout,
        }
    }

    /// Count one; past the limit the exchange ends as a timeout
    fn note(&mut self, what: &str) -> Result<(), AttemptError> {
        self.seen += 1;
        if self.seen > self.limit {
            debug!("Giving up after {} {} frames", self.limit, what);
            return Err(AdapterError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
            .into());
        }
        Ok(())
    }
}

/// Failure of a single attempt, before context is attached
#[derive(Debug)]
pub(crate) enum AttemptError {
    Adapter(AdapterError),
    Protocol { source: ProtocolError, raw: Vec<u8> },
}

impl From<AdapterError> for AttemptError {
    fn from(err: AdapterError) -> Self {
        AttemptError::Adapter(err)
    }
}

impl AttemptError {
    fn protocol(source: ProtocolError) -> Self {
        AttemptError::Protocol {
            source,
            raw: Vec::new(),
        }
    }

    fn with_raw(source: ProtocolError, raw: &[u8]) -> Self {
        AttemptError::Protocol {
            source,
            raw: raw.to_vec(),
        }
    }

    pub(crate) fn into_obd(self, transport: Transport, request: &ParameterRequest) -> ObdError {
        match self {
            AttemptError::Adapter(e) if e.is_fatal() => ObdError::Adapter(e),
            AttemptError::Adapter(source) => ObdError::Transport {
                transport,
                mode: request.mode,
                pid: request.pid,
                source,
            },
            AttemptError::Protocol { source, raw } => ObdError::Protocol {
                transport,
                mode: request.mode,
                pid: request.pid,
                raw,
                source,
            },
        }
    }
}

/// Open a channel with the transport's default flags and bit rate
pub(crate) async fn open_channel(
    adapter: &dyn DeviceAdapter,
    transport: Transport,
) -> Result<ChannelHandle, AdapterError> {
    adapter
        .connect(transport, transport.connect_flags(), transport.bus_baud_rate())
        .await
}

/// One request/response exchange on an open channel, without retries
pub(crate) async fn exchange(
    adapter: &dyn DeviceAdapter,
    transport: Transport,
    handle: ChannelHandle,
    request: &ParameterRequest,
    timeout: Duration,
    max_frames: usize,
) -> Result<ParameterResponse, AttemptError> {
    let payload = request.to_payload();
    let frames = encode_request(transport, &payload).map_err(AttemptError::protocol)?;
    debug!("Request {:02X?} on {}", payload, transport);

    match transport.family() {
        TransportFamily::Can => send_can(adapter, handle, &frames, timeout, max_frames).await?,
        _ => {
            for frame in &frames {
                adapter.send_frame(handle, &frame.to_bytes(), timeout).await?;
            }
        }
    }

    let (service, checksum) = match transport.family() {
        TransportFamily::Can => (receive_can(adapter, handle, timeout, max_frames).await?, None),
        _ => receive_serial(adapter, transport, handle, request, timeout, max_frames).await?,
    };
    trace!("Response service bytes {:02X?}", service);

    request
        .parse_response(&service, checksum, transport.is_can())
        .map_err(|e| AttemptError::with_raw(e, &service))
}

/// Send ISO-TP frames, honouring the receiver's Flow Control
async fn send_can(
    adapter: &dyn DeviceAdapter,
    handle: ChannelHandle,
    frames: &[TransportFrame],
    timeout: Duration,
    max_frames: usize,
) -> Result<(), AttemptError> {
    let Some((first, rest)) = frames.split_first() else {
        return Ok(());
    };
    adapter.send_frame(handle, &first.to_bytes(), timeout).await?;

    let mut pending = rest.iter();
    let mut remaining = rest.len();
    while remaining > 0 {
        let (block_size, st_min) = await_flow_control(adapter, handle, timeout, max_frames).await?;
        let gap = isotp::separation_time(st_min);
        let block = if block_size == 0 {
            remaining
        } else {
            (block_size as usize).min(remaining)
        };
        for frame in pending.by_ref().take(block) {
            if !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }
            adapter.send_frame(handle, &frame.to_bytes(), timeout).await?;
        }
        remaining -= block;
    }
    Ok(())
}

async fn await_flow_control(
    adapter: &dyn DeviceAdapter,
    handle: ChannelHandle,
    timeout: Duration,
    max_frames: usize,
) -> Result<(u8, u8), AttemptError> {
    let mut foreign = IdleFrames::new(max_frames, timeout);
    let mut waits = IdleFrames::new(MAX_FLOW_WAITS, timeout);
    loop {
        let bytes = adapter.receive_frame(handle, timeout).await?;
        let frame = CanFrame::from_bytes(&bytes).map_err(|e| AttemptError::with_raw(e, &bytes))?;
        if !can::is_obd_response(frame.arbitration_id) {
            foreign.note("foreign")?;
            continue;
        }
        match IsoTpFrame::parse(&frame.data).map_err(|e| AttemptError::with_raw(e, &bytes))? {
            IsoTpFrame::FlowControl {
                status: FlowStatus::ContinueToSend,
                block_size,
                st_min,
            } => return Ok((block_size, st_min)),
            IsoTpFrame::FlowControl {
                status: FlowStatus::Wait,
                ..
            } => {
                trace!("Receiver asked to wait");
                waits.note("flow control wait")?;
            }
            IsoTpFrame::FlowControl {
                status: FlowStatus::Overflow,
                ..
            } => {
                return Err(AttemptError::with_raw(
                    ProtocolError::UnexpectedFrame("receiver overflow".into()),
                    &bytes,
                ))
            }
            other => {
                return Err(AttemptError::with_raw(
                    ProtocolError::UnexpectedFrame(format!("expected flow control, got {:?}", other)),
                    &bytes,
                ))
            }
        }
    }
}

/// Reassemble one ISO-TP response, sending Flow Control after a First
/// Frame to the physical id of the answering ECU
async fn receive_can(
    adapter: &dyn DeviceAdapter,
    handle: ChannelHandle,
    timeout: Duration,
    max_frames: usize,
) -> Result<Vec<u8>, AttemptError> {
    let mut reassembler = Reassembler::new();
    let mut sender: Option<u32> = None;
    let mut received = 0usize;
    let mut ignored = IdleFrames::new(max_frames, timeout);

    loop {
        let bytes = adapter.receive_frame(handle, timeout).await?;
        let frame = CanFrame::from_bytes(&bytes).map_err(|e| AttemptError::with_raw(e, &bytes))?;
        if !can::is_obd_response(frame.arbitration_id) {
            trace!("Ignoring CAN id {:X}", frame.arbitration_id);
            ignored.note("foreign")?;
            continue;
        }
        // Once a multi-frame answer starts, other ECUs are ignored
        if sender.is_some_and(|id| id != frame.arbitration_id) {
            trace!("Ignoring interleaved CAN id {:X}", frame.arbitration_id);
            ignored.note("interleaved")?;
            continue;
        }

        received += 1;
        if received > max_frames {
            return Err(AttemptError::with_raw(
                ProtocolError::UnexpectedFrame(format!("more than {} frames", max_frames)),
                &bytes,
            ));
        }

        let pdu = IsoTpFrame::parse(&frame.data).map_err(|e| AttemptError::with_raw(e, &bytes))?;
        match reassembler
            .push(pdu)
            .map_err(|e| AttemptError::with_raw(e, &bytes))?
        {
            Reassembly::Complete(service) => {
                if is_response_pending(&service) {
                    debug!("ECU {:X} reports response pending", frame.arbitration_id);
                    sender = None;
                    continue;
                }
                return Ok(service);
            }
            Reassembly::NeedFlowControl => {
                sender = Some(frame.arbitration_id);
                let target = can::physical_request_id(frame.arbitration_id).ok_or_else(|| {
                    AttemptError::with_raw(
                        ProtocolError::UnexpectedFrame(format!(
                            "no physical id for {:X}",
                            frame.arbitration_id
                        )),
                        &bytes,
                    )
                })?;
                let fc = CanFrame::padded(target, IsoTpFrame::clear_to_send().to_bytes())
                    .map_err(AttemptError::protocol)?;
                adapter.send_frame(handle, &fc.to_bytes(), timeout).await?;
            }
            Reassembly::InProgress => {}
        }
    }
}

/// J1850 and K-line answers. DTC reads may span several frames, which are
/// collected until the bus goes quiet and merged into one service response.
async fn receive_serial(
    adapter: &dyn DeviceAdapter,
    transport: Transport,
    handle: ChannelHandle,
    request: &ParameterRequest,
    timeout: Duration,
    max_frames: usize,
) -> Result<(Vec<u8>, Option<u8>), AttemptError> {
    let multi = request.is_dtc_mode() && !request.has_pid();
    let mut service: Vec<u8> = Vec::new();
    let mut checksum = None;
    let mut received = 0usize;
    let mut pending = IdleFrames::new(max_frames, timeout);

    loop {
        let bytes = match adapter.receive_frame(handle, timeout).await {
            Ok(bytes) => bytes,
            Err(AdapterError::Timeout { .. } | AdapterError::NoResponse) if received > 0 => break,
            Err(e) => return Err(e.into()),
        };
        let (body, sum) = decode_serial_frame(transport, &bytes)?;
        if is_response_pending(&body) {
            debug!("ECU reports response pending");
            pending.note("response pending")?;
            continue;
        }

        received += 1;
        if service.is_empty() {
            service = body;
        } else if body.first() == service.first() {
            service.extend_from_slice(&body[1..]);
        } else {
            trace!("Ignoring frame {:02X?} after DTC answer", bytes);
        }
        checksum = sum;

        if !multi || service.first() == Some(&mode::NEGATIVE_RESPONSE) || received >= max_frames {
            break;
        }
    }
    Ok((service, checksum))
}

fn decode_serial_frame(
    transport: Transport,
    bytes: &[u8],
) -> Result<(Vec<u8>, Option<u8>), AttemptError> {
    match transport.family() {
        TransportFamily::J1850 => {
            let frame = J1850Frame::from_bytes(bytes).map_err(|e| AttemptError::with_raw(e, bytes))?;
            Ok((frame.payload, None))
        }
        _ => {
            let frame = KLineFrame::decode(kline_style(transport), bytes)
                .map_err(|e| AttemptError::with_raw(e, bytes))?;
            Ok((frame.service_bytes(), Some(frame.checksum)))
        }
    }
}

fn is_response_pending(service: &[u8]) -> bool {
    matches!(service, [mode::NEGATIVE_RESPONSE, _, NRC_RESPONSE_PENDING])
}

#[derive(Debug, Clone, Copy)]
struct Link {
    transport: Transport,
    handle: ChannelHandle,
}

/// Sends requests over the negotiated channel of one adapter
pub struct RequestEngine {
    adapter: Arc<dyn DeviceAdapter>,
    config: EngineConfig,
    link: Arc<SyncMutex<Option<Link>>>,
    stats: RequestStatistics,
    consecutive_errors: u32,
}

impl RequestEngine {
    pub fn new(adapter: Arc<dyn DeviceAdapter>, config: EngineConfig) -> Self {
        Self {
            adapter,
            config,
            link: Arc::new(SyncMutex::new(None)),
            stats: RequestStatistics::default(),
            consecutive_errors: 0,
        }
    }

    /// Use an already open channel
    pub fn attach(&mut self, transport: Transport, handle: ChannelHandle) {
        info!("Engine attached to {} on {}", handle, transport);
        *self.link.lock() = Some(Link { transport, handle });
        self.consecutive_errors = 0;
    }

    /// Forget the channel without closing it
    pub fn detach(&mut self) {
        *self.link.lock() = None;
    }

    fn current(&self) -> Option<Link> {
        *self.link.lock()
    }

    pub fn transport(&self) -> Option<Transport> {
        self.current().map(|l| l.transport)
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.current().map(|l| l.handle)
    }

    pub fn adapter(&self) -> &Arc<dyn DeviceAdapter> {
        &self.adapter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Closer that follows the engine across reconnects
    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            adapter: self.adapter.clone(),
            link: self.link.clone(),
        }
    }

    pub fn statistics(&self) -> &RequestStatistics {
        &self.stats
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Whether enough requests failed in a row to warrant re-negotiation
    pub fn needs_renegotiation(&self) -> bool {
        self.consecutive_errors >= self.config.renegotiate_after
    }

    /// Send a request and wait for its decoded response
    pub async fn send(&mut self, request: &ParameterRequest) -> ObdResult<ParameterResponse> {
        let link = self.current().ok_or(ObdError::NotNegotiated)?;
        self.stats.requests += 1;
        match self.send_with_retries(link, request).await {
            Ok(response) => {
                self.stats.successes += 1;
                self.consecutive_errors = 0;
                Ok(response)
            }
            Err(e) => {
                self.stats.failures += 1;
                self.consecutive_errors += 1;
                if let Some(source) = e.protocol_error() {
                    match source {
                        ProtocolError::ChecksumMismatch { .. } => self.stats.checksum_errors += 1,
                        ProtocolError::NegativeResponse { .. } => {
                            self.stats.negative_responses += 1
                        }
                        _ => {}
                    }
                }
                if self.needs_renegotiation() {
                    warn!(
                        "{} consecutive request failures on {}",
                        self.consecutive_errors, link.transport
                    );
                }
                Err(e)
            }
        }
    }

    async fn send_with_retries(
        &mut self,
        mut link: Link,
        request: &ParameterRequest,
    ) -> ObdResult<ParameterResponse> {
        let timeout = self.config.timeout(link.transport);
        let mut attempt = 0u32;

        loop {
            let started = Instant::now();
            let result = exchange(
                self.adapter.as_ref(),
                link.transport,
                link.handle,
                request,
                timeout,
                self.config.max_response_frames,
            )
            .await;

            let err = match result {
                Ok(response) => {
                    self.stats.total_response_ms += started.elapsed().as_millis() as u64;
                    return Ok(response);
                }
                Err(AttemptError::Adapter(e)) if e.is_transient() => e,
                Err(e) => {
                    if matches!(e, AttemptError::Protocol { .. }) {
                        self.drain(link).await;
                    }
                    return Err(e.into_obd(link.transport, request));
                }
            };

            if matches!(err, AdapterError::Timeout { .. }) {
                self.stats.timeouts += 1;
            }
            if attempt >= self.config.max_retries {
                debug!("Giving up after {} attempts: {}", attempt + 1, err);
                return Err(AttemptError::Adapter(err).into_obd(link.transport, request));
            }
            attempt += 1;
            self.stats.retries += 1;
            let delay = self.config.backoff(attempt);
            debug!(
                "Mode {:02X} PID {:02X} failed ({}), retry {} in {:?}",
                request.mode, request.pid, err, attempt, delay
            );
            tokio::time::sleep(delay).await;

            if err.needs_reconnect() || !self.adapter.is_channel_open(link.handle) {
                match self.reconnect(link.transport).await {
                    Ok(relinked) => link = relinked,
                    Err(e) if e.is_fatal() => return Err(ObdError::Adapter(e)),
                    Err(e) => debug!("Reconnect failed: {}", e),
                }
            }
        }
    }

    async fn reconnect(&mut self, transport: Transport) -> Result<Link, AdapterError> {
        info!("Reopening channel on {}", transport);
        let handle = open_channel(self.adapter.as_ref(), transport).await?;
        self.stats.reconnects += 1;
        let link = Link { transport, handle };
        *self.link.lock() = Some(link);
        Ok(link)
    }

    /// Discard frames left over from a failed exchange
    async fn drain(&self, link: Link) {
        for _ in 0..MAX_DRAIN_FRAMES {
            match self.adapter.receive_frame(link.handle, DRAIN_TIMEOUT).await {
                Ok(bytes) => trace!("Discarding stale frame {:02X?}", bytes),
                Err(_) => break,
            }
        }
    }
}
