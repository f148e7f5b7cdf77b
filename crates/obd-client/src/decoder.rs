//! Diagnostic Decoder
//!
//! Turns engine responses into typed diagnostic data: live values, trouble
//! codes with status, freeze frames and supported-PID sets.

use crate::engine::RequestEngine;
use crate::error::{ObdError, ObdResult};
use obd_protocol::{
    decode_dtc_pairs, decode_pid, decode_supported_pids, lookup_pid, mode, parse_dtc,
    timestamp_ms, DtcEntry, FreezeFrame, ParameterRequest, PidValue, ProtocolError, Transport,
};
use tracing::{debug, info, warn};

/// Freeze frame PID holding the DTC that stored the frame
const FREEZE_FRAME_DTC_PID: u8 = 0x02;

/// Highest "PIDs supported" page
const LAST_SUPPORT_PAGE: u8 = 0xE0;

/// Decoder over a borrowed engine
pub struct DiagnosticDecoder<'a> {
    engine: &'a mut RequestEngine,
}

impl<'a> DiagnosticDecoder<'a> {
    pub fn new(engine: &'a mut RequestEngine) -> Self {
        Self { engine }
    }

    fn transport(&self) -> ObdResult<Transport> {
        self.engine.transport().ok_or(ObdError::NotNegotiated)
    }

    fn decode_error(&self, request: &ParameterRequest, raw: &[u8], source: ProtocolError) -> ObdError {
        match self.transport() {
            Ok(transport) => ObdError::Protocol {
                transport,
                mode: request.mode,
                pid: request.pid,
                raw: raw.to_vec(),
                source,
            },
            Err(e) => e,
        }
    }

    /// Current value of one PID
    pub async fn query(&mut self, pid: u8) -> ObdResult<PidValue> {
        let request = ParameterRequest::current(pid);
        let response = self.engine.send(&request).await?;
        decode_pid(pid, &response.payload)
            .map_err(|e| self.decode_error(&request, &response.payload, e))
    }

    /// Supported PIDs for Mode 01 or 02, walking the bitmap pages
    pub async fn supported_pids(&mut self, service: u8) -> ObdResult<Vec<u8>> {
        if service != mode::CURRENT_DATA && service != mode::FREEZE_FRAME {
            return Err(ObdError::InvalidRequest(format!(
                "mode {:02X} has no supported-PID bitmap",
                service
            )));
        }

        let mut supported = Vec::new();
        let mut base = 0u8;
        loop {
            let request = ParameterRequest::new(service, base);
            let response = match self.engine.send(&request).await {
                Ok(response) => response,
                // Later pages may be refused even when advertised
                Err(e) if base > 0 && e.is_protocol() => {
                    debug!("Support page {:02X} unavailable: {}", base, e);
                    break;
                }
                Err(e) => return Err(e),
            };
            let pids = decode_supported_pids(base, &response.payload)
                .map_err(|e| self.decode_error(&request, &response.payload, e))?;

            let next = base.checked_add(0x20);
            let has_next = next.is_some_and(|n| pids.contains(&n));
            supported.extend(pids.into_iter().filter(|p| p % 0x20 != 0));

            match next {
                Some(n) if has_next && base < LAST_SUPPORT_PAGE => base = n,
                _ => break,
            }
        }
        debug!("Mode {:02X} supports {} PIDs", service, supported.len());
        Ok(supported)
    }

    /// Stored trouble codes with their status bytes
    pub async fn read_dtcs(&mut self) -> ObdResult<Vec<DtcEntry>> {
        let codes = self.read_codes(mode::READ_DTC).await?;
        let read_at = timestamp_ms();
        let mut entries = Vec::with_capacity(codes.len());
        for raw_code in codes {
            let status = self.dtc_status(raw_code).await?;
            entries.push(DtcEntry::new(raw_code, status, read_at));
        }
        info!("Read {} trouble codes", entries.len());
        Ok(entries)
    }

    /// Pending trouble codes (Mode 07), status as reported
    pub async fn read_pending_dtcs(&mut self) -> ObdResult<Vec<DtcEntry>> {
        let read_at = timestamp_ms();
        Ok(self
            .read_codes(mode::PENDING_DTC)
            .await?
            .into_iter()
            .map(|raw_code| DtcEntry::new(raw_code, 0, read_at))
            .collect())
    }

    async fn read_codes(&mut self, service: u8) -> ObdResult<Vec<u16>> {
        let request = ParameterRequest::service(service);
        let response = self.engine.send(&request).await?;
        decode_dtc_pairs(&response.payload)
            .map_err(|e| self.decode_error(&request, &response.payload, e))
    }

    /// Status byte of one code. A failed status query yields 0; fatal
    /// adapter errors still propagate.
    async fn dtc_status(&mut self, raw_code: u16) -> ObdResult<u8> {
        match self.engine.send(&ParameterRequest::dtc_status(raw_code)).await {
            Ok(response) => Ok(response.payload.first().copied().unwrap_or(0)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Status query for {:04X} failed, using 0: {}", raw_code, e);
                Ok(0)
            }
        }
    }

    /// Freeze frame stored for `dtc`. Empty when the stored frame belongs to
    /// a different code.
    pub async fn read_freeze_frame(&mut self, dtc: &str) -> ObdResult<Vec<FreezeFrame>> {
        let raw = parse_dtc(dtc).map_err(|e| ObdError::InvalidRequest(e.to_string()))?;
        let canonical = obd_protocol::format_dtc(raw);

        let request = ParameterRequest::freeze_frame(FREEZE_FRAME_DTC_PID);
        let response = self.engine.send(&request).await?;
        let stored = match response.payload.as_slice() {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            _ => {
                return Err(self.decode_error(
                    &request,
                    &response.payload,
                    ProtocolError::InsufficientData {
                        pid: FREEZE_FRAME_DTC_PID,
                        needed: 2,
                        got: response.payload.len(),
                    },
                ))
            }
        };
        if stored == 0 || stored != raw {
            debug!("Freeze frame belongs to {:04X}, not {}", stored, canonical);
            return Ok(Vec::new());
        }

        let pids: Vec<u8> = self
            .supported_pids(mode::FREEZE_FRAME)
            .await?
            .into_iter()
            .filter(|&pid| pid != FREEZE_FRAME_DTC_PID && lookup_pid(pid).is_some())
            .collect();

        let mut frames = Vec::with_capacity(pids.len());
        for pid in pids {
            let request = ParameterRequest::freeze_frame(pid);
            let response = match self.engine.send(&request).await {
                Ok(response) => response,
                Err(e) if e.is_protocol() => {
                    warn!("Freeze frame PID {:02X} skipped: {}", pid, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let value = decode_pid(pid, &response.payload)
                .map_err(|e| self.decode_error(&request, &response.payload, e))?;
            frames.push(FreezeFrame {
                triggering_dtc: canonical.clone(),
                pid,
                name: value.name,
                raw_bytes: value.raw_bytes,
                value: value.value,
                unit: value.unit,
            });
        }
        Ok(frames)
    }

    /// Mode 04. True only when the ECU answers 0x44; a refusal is false.
    pub async fn clear_dtcs(&mut self) -> ObdResult<bool> {
        match self.engine.send(&ParameterRequest::service(mode::CLEAR_DTC)).await {
            Ok(_) => {
                info!("Trouble codes cleared");
                Ok(true)
            }
            Err(ObdError::Protocol {
                source: ProtocolError::NegativeResponse { code, .. },
                ..
            }) => {
                warn!("ECU refused to clear trouble codes (NRC {:02X})", code);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
