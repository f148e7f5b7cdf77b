//! Adapter configuration and reported capabilities

use crate::error::{AdapterError, AdapterResult};
use obd_protocol::Transport;
use safety_validator::SafetyLimits;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Oldest bridge firmware that may accept tuning writes
pub const MIN_TUNING_FIRMWARE: FirmwareVersion = FirmwareVersion::new(2, 9, 0);

/// Closed set of supported interface devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// SAE J2534 PassThru interface
    PassThru,
    /// ELM327 terminal-command interface
    Elm327,
    /// Microcontroller bridge speaking postcard over serial
    Bridge,
    /// In-process virtual vehicle
    #[default]
    Simulator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::PassThru => "passthru",
            DeviceKind::Elm327 => "elm327",
            DeviceKind::Bridge => "bridge",
            DeviceKind::Simulator => "simulator",
        };
        f.write_str(name)
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passthru" | "j2534" => Ok(DeviceKind::PassThru),
            "elm327" | "elm" => Ok(DeviceKind::Elm327),
            "bridge" | "mcu" => Ok(DeviceKind::Bridge),
            "simulator" | "sim" => Ok(DeviceKind::Simulator),
            other => Err(format!("unknown device kind: {}", other)),
        }
    }
}

/// Adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub kind: DeviceKind,
    /// Serial port for ELM327 and bridge devices
    pub port: Option<String>,
    /// Host-side serial baud rate
    pub serial_baud_rate: u32,
    /// PassThru device name handed to `PassThruOpen`
    pub library: Option<String>,
    /// Bound on the init dialogue
    pub init_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Simulator,
            port: None,
            serial_baud_rate: 38400,
            library: None,
            init_timeout_ms: 5000,
        }
    }
}

impl AdapterConfig {
    /// Serial port, required for serial device kinds
    pub fn require_port(&self) -> AdapterResult<&str> {
        self.port.as_deref().ok_or_else(|| {
            AdapterError::InvalidConfiguration(format!("{} adapter needs a serial port", self.kind))
        })
    }
}

/// Dotted firmware version, e.g. "2.9.1"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl FirmwareVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = String;

    /// Accepts "2.9", "2.9.1" and "v1.5"; missing parts are zero
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        let mut parts = [0u16; 3];
        let mut count = 0;
        for (i, part) in trimmed.split('.').enumerate() {
            if i >= 3 {
                return Err(format!("too many version components: {}", s));
            }
            parts[i] = part
                .parse()
                .map_err(|_| format!("invalid firmware version: {}", s))?;
            count += 1;
        }
        if count < 2 {
            return Err(format!("invalid firmware version: {}", s));
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

/// Check that a tuning-capable device runs recent enough firmware
pub fn check_tuning_compatibility(found: FirmwareVersion) -> AdapterResult<()> {
    if found < MIN_TUNING_FIRMWARE {
        return Err(AdapterError::IncompatibleFirmware {
            required: MIN_TUNING_FIRMWARE.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

/// What a device reported during initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub kind: DeviceKind,
    /// Transports the device can connect
    pub transports: Vec<Transport>,
    pub max_sample_rate_hz: u32,
    /// Whether more than one bus can be open at once
    pub multi_bus: bool,
    /// Limits enforced by the device itself, if it reports any
    pub safety_limits: Option<SafetyLimits>,
    pub firmware_version: Option<FirmwareVersion>,
    /// Whether the device accepts parameter writes
    pub supports_tuning: bool,
}

impl DeviceCapabilities {
    pub fn supports(&self, transport: Transport) -> bool {
        self.transports.contains(&transport)
    }
}

/// Snapshot of the device state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub kind: DeviceKind,
    pub firmware_version: Option<FirmwareVersion>,
    /// Free-form identification, e.g. "ELM327 v1.5"
    pub description: String,
    /// Battery voltage, when the device can measure it
    pub voltage: Option<f64>,
    pub active_transport: Option<Transport>,
    pub channel_open: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_parsing() {
        assert_eq!("2.9.1".parse::<FirmwareVersion>().unwrap(), FirmwareVersion::new(2, 9, 1));
        assert_eq!("v1.5".parse::<FirmwareVersion>().unwrap(), FirmwareVersion::new(1, 5, 0));
        assert!("2".parse::<FirmwareVersion>().is_err());
        assert!("2.x".parse::<FirmwareVersion>().is_err());
        assert!("1.2.3.4".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn test_tuning_compatibility() {
        assert!(check_tuning_compatibility(FirmwareVersion::new(2, 9, 0)).is_ok());
        assert!(check_tuning_compatibility(FirmwareVersion::new(3, 0, 0)).is_ok());
        assert!(matches!(
            check_tuning_compatibility(FirmwareVersion::new(2, 8, 9)),
            Err(AdapterError::IncompatibleFirmware { .. })
        ));
    }

    #[test]
    fn test_device_kind_parsing() {
        assert_eq!("J2534".parse::<DeviceKind>().unwrap(), DeviceKind::PassThru);
        assert_eq!("sim".parse::<DeviceKind>().unwrap(), DeviceKind::Simulator);
        assert!("socketcan".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_serial_kinds_need_port() {
        let config = AdapterConfig {
            kind: DeviceKind::Elm327,
            ..Default::default()
        };
        assert!(matches!(
            config.require_port(),
            Err(AdapterError::InvalidConfiguration(_))
        ));
    }
}
