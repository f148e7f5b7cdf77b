//! OBD-II PID Definitions and Conversions
//!
//! One table serves live data (Mode 01) and freeze frames (Mode 02), so a
//! PID always converts the same way regardless of where it was read.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Commonly monitored Mode 01 PIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Intake air temperature (0x0F)
    IntakeTemp = 0x0F,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
    /// Fuel tank level (0x2F)
    FuelLevel = 0x2F,
    /// Control module voltage (0x42)
    ModuleVoltage = 0x42,
}

impl Pid {
    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Default live-data set for monitoring
    pub fn default_monitor_set() -> Vec<u8> {
        [
            Pid::Rpm,
            Pid::Speed,
            Pid::CoolantTemp,
            Pid::EngineLoad,
            Pid::ThrottlePosition,
            Pid::Maf,
        ]
        .iter()
        .map(Pid::as_hex)
        .collect()
    }
}

/// Conversion entry for one PID
#[derive(Debug, Clone, Copy)]
pub struct PidDefinition {
    pub pid: u8,
    pub name: &'static str,
    pub unit: &'static str,
    /// Data bytes the formula reads
    pub bytes: usize,
    formula: fn(&[u8]) -> f64,
}

impl PidDefinition {
    /// Apply the formula. Extra bytes are ignored.
    pub fn decode(&self, data: &[u8]) -> Result<f64, ProtocolError> {
        if data.len() < self.bytes {
            return Err(ProtocolError::InsufficientData {
                pid: self.pid,
                needed: self.bytes,
                got: data.len(),
            });
        }
        Ok((self.formula)(data))
    }
}

const fn def(
    pid: u8,
    name: &'static str,
    unit: &'static str,
    bytes: usize,
    formula: fn(&[u8]) -> f64,
) -> PidDefinition {
    PidDefinition {
        pid,
        name,
        unit,
        bytes,
        formula,
    }
}

fn percent(d: &[u8]) -> f64 {
    d[0] as f64 * 100.0 / 255.0
}

fn temperature(d: &[u8]) -> f64 {
    d[0] as f64 - 40.0
}

fn fuel_trim(d: &[u8]) -> f64 {
    (d[0] as f64 - 128.0) * 100.0 / 128.0
}

fn raw_byte(d: &[u8]) -> f64 {
    d[0] as f64
}

fn word(d: &[u8]) -> f64 {
    d[0] as f64 * 256.0 + d[1] as f64
}

fn o2_voltage(d: &[u8]) -> f64 {
    d[0] as f64 * 0.005
}

fn fuel_pressure(d: &[u8]) -> f64 {
    d[0] as f64 * 3.0
}

fn rpm(d: &[u8]) -> f64 {
    word(d) / 4.0
}

fn timing_advance(d: &[u8]) -> f64 {
    d[0] as f64 / 2.0 - 64.0
}

fn maf(d: &[u8]) -> f64 {
    word(d) / 100.0
}

fn millivolts(d: &[u8]) -> f64 {
    word(d) / 1000.0
}

/// The shared PID conversion table
pub const PID_TABLE: &[PidDefinition] = &[
    def(0x04, "Calculated engine load", "%", 1, percent),
    def(0x05, "Engine coolant temperature", "°C", 1, temperature),
    def(0x06, "Short term fuel trim bank 1", "%", 1, fuel_trim),
    def(0x07, "Long term fuel trim bank 1", "%", 1, fuel_trim),
    def(0x08, "Short term fuel trim bank 2", "%", 1, fuel_trim),
    def(0x09, "Long term fuel trim bank 2", "%", 1, fuel_trim),
    def(0x0A, "Fuel pressure", "kPa", 1, fuel_pressure),
    def(0x0B, "Intake manifold absolute pressure", "kPa", 1, raw_byte),
    def(0x0C, "Engine RPM", "rpm", 2, rpm),
    def(0x0D, "Vehicle speed", "km/h", 1, raw_byte),
    def(0x0E, "Timing advance", "°", 1, timing_advance),
    def(0x0F, "Intake air temperature", "°C", 1, temperature),
    def(0x10, "Mass air flow rate", "g/s", 2, maf),
    def(0x11, "Throttle position", "%", 1, percent),
    def(0x14, "O2 sensor voltage bank 1 sensor 1", "V", 1, o2_voltage),
    def(0x15, "O2 sensor voltage bank 1 sensor 2", "V", 1, o2_voltage),
    def(0x16, "O2 sensor voltage bank 1 sensor 3", "V", 1, o2_voltage),
    def(0x17, "O2 sensor voltage bank 1 sensor 4", "V", 1, o2_voltage),
    def(0x1F, "Run time since engine start", "s", 2, word),
    def(0x21, "Distance traveled with MIL on", "km", 2, word),
    def(0x2F, "Fuel tank level", "%", 1, percent),
    def(0x33, "Barometric pressure", "kPa", 1, raw_byte),
    def(0x42, "Control module voltage", "V", 2, millivolts),
    def(0x46, "Ambient air temperature", "°C", 1, temperature),
    def(0x5C, "Engine oil temperature", "°C", 1, temperature),
];

/// Find the conversion for a PID
pub fn lookup_pid(pid: u8) -> Option<&'static PidDefinition> {
    PID_TABLE.iter().find(|d| d.pid == pid)
}

/// A converted parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidValue {
    pub pid: u8,
    pub name: String,
    pub value: f64,
    pub unit: String,
    /// Data bytes the value was converted from
    pub raw_bytes: Vec<u8>,
}

/// Convert data bytes for `pid` through the shared table
pub fn decode_pid(pid: u8, data: &[u8]) -> Result<PidValue, ProtocolError> {
    let definition = lookup_pid(pid).ok_or(ProtocolError::UnknownPid(pid))?;
    let value = definition.decode(data)?;
    Ok(PidValue {
        pid,
        name: definition.name.to_string(),
        value,
        unit: definition.unit.to_string(),
        raw_bytes: data.to_vec(),
    })
}

/// Whether `pid` is one of the "PIDs supported" bitmaps (0x00, 0x20, ...)
pub fn is_support_pid(pid: u8) -> bool {
    pid % 0x20 == 0
}

/// Expand a 4-byte support bitmap for `base` into PID numbers.
///
/// Bit 7 of the first byte is `base + 1`, bit 0 of the last byte is
/// `base + 32`.
pub fn decode_supported_pids(base: u8, bitmap: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if !is_support_pid(base) {
        return Err(ProtocolError::UnexpectedResponse {
            expected: base & 0xE0,
            actual: base,
        });
    }
    if bitmap.len() < 4 {
        return Err(ProtocolError::InsufficientData {
            pid: base,
            needed: 4,
            got: bitmap.len(),
        });
    }
    let mut pids = Vec::new();
    for (byte_index, byte) in bitmap[..4].iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                let offset = (byte_index * 8 + bit + 1) as u16;
                let pid = base as u16 + offset;
                if pid <= 0xFF {
                    pids.push(pid as u8);
                }
            }
        }
    }
    Ok(pids)
}
