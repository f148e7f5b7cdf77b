//! OBD-II Transport Definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// J2534 connect flag selecting 29-bit CAN identifiers
pub const CAN_29BIT_ID: u32 = 0x0000_0100;

/// Physical layer family, which decides the frame codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportFamily {
    /// ISO 15765-4 CAN with ISO-TP segmentation
    Can,
    /// SAE J1850 PWM or VPW
    J1850,
    /// ISO 9141-2 / ISO 14230-4 K-line
    KLine,
}

/// Supported OBD-II transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl Transport {
    /// Every transport, in ELM327 protocol number order
    pub const ALL: [Transport; 9] = [
        Transport::J1850Pwm,
        Transport::J1850Vpw,
        Transport::Iso9141_2,
        Transport::Iso14230_4Kwp,
        Transport::Iso14230_4KwpFast,
        Transport::Iso15765_4Can11bit500,
        Transport::Iso15765_4Can29bit500,
        Transport::Iso15765_4Can11bit250,
        Transport::Iso15765_4Can29bit250,
    ];

    /// Get the ELM327 AT command for this transport
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            Transport::J1850Pwm => "ATSP1",
            Transport::J1850Vpw => "ATSP2",
            Transport::Iso9141_2 => "ATSP3",
            Transport::Iso14230_4Kwp => "ATSP4",
            Transport::Iso14230_4KwpFast => "ATSP5",
            Transport::Iso15765_4Can11bit500 => "ATSP6",
            Transport::Iso15765_4Can29bit500 => "ATSP7",
            Transport::Iso15765_4Can11bit250 => "ATSP8",
            Transport::Iso15765_4Can29bit250 => "ATSP9",
        }
    }

    /// ELM327 protocol number (as reported by `ATDPN`)
    pub fn elm_protocol_number(&self) -> u8 {
        match self {
            Transport::J1850Pwm => 1,
            Transport::J1850Vpw => 2,
            Transport::Iso9141_2 => 3,
            Transport::Iso14230_4Kwp => 4,
            Transport::Iso14230_4KwpFast => 5,
            Transport::Iso15765_4Can11bit500 => 6,
            Transport::Iso15765_4Can29bit500 => 7,
            Transport::Iso15765_4Can11bit250 => 8,
            Transport::Iso15765_4Can29bit250 => 9,
        }
    }

    /// Reverse of [`Transport::elm_protocol_number`]
    pub fn from_elm_protocol_number(number: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.elm_protocol_number() == number)
    }

    /// J2534 protocol id passed to `PassThruConnect`
    pub fn passthru_protocol_id(&self) -> u32 {
        match self {
            Transport::J1850Vpw => 1,
            Transport::J1850Pwm => 2,
            Transport::Iso9141_2 => 3,
            Transport::Iso14230_4Kwp | Transport::Iso14230_4KwpFast => 4,
            _ => 5,
        }
    }

    /// Default J2534 connect flags
    pub fn connect_flags(&self) -> u32 {
        if self.is_extended_id() {
            CAN_29BIT_ID
        } else {
            0
        }
    }

    /// Bus bit rate in bits per second
    pub fn bus_baud_rate(&self) -> u32 {
        match self {
            Transport::J1850Pwm => 41_600,
            Transport::J1850Vpw | Transport::Iso9141_2 => 10_400,
            Transport::Iso14230_4Kwp | Transport::Iso14230_4KwpFast => 10_400,
            Transport::Iso15765_4Can11bit500 | Transport::Iso15765_4Can29bit500 => 500_000,
            Transport::Iso15765_4Can11bit250 | Transport::Iso15765_4Can29bit250 => 250_000,
        }
    }

    /// Codec family for this transport
    pub fn family(&self) -> TransportFamily {
        match self {
            Transport::J1850Pwm | Transport::J1850Vpw => TransportFamily::J1850,
            Transport::Iso9141_2 | Transport::Iso14230_4Kwp | Transport::Iso14230_4KwpFast => {
                TransportFamily::KLine
            }
            _ => TransportFamily::Can,
        }
    }

    /// Check if this is a CAN transport
    pub fn is_can(&self) -> bool {
        self.family() == TransportFamily::Can
    }

    /// Check if this transport uses 29-bit CAN identifiers
    pub fn is_extended_id(&self) -> bool {
        matches!(
            self,
            Transport::Iso15765_4Can29bit500 | Transport::Iso15765_4Can29bit250
        )
    }

    /// Check if this is a KWP2000 (ISO 14230-4) transport
    pub fn is_kwp(&self) -> bool {
        matches!(self, Transport::Iso14230_4Kwp | Transport::Iso14230_4KwpFast)
    }

    /// Default time to wait for an ECU response
    pub fn default_timeout(&self) -> Duration {
        match self.family() {
            TransportFamily::Can => Duration::from_millis(250),
            TransportFamily::J1850 => Duration::from_millis(300),
            // K-line P2 plus the slow bit rate
            TransportFamily::KLine => Duration::from_millis(1000),
        }
    }

    /// Get the default baud rate for serial communication with an ELM327
    pub fn default_serial_baud_rate(&self) -> u32 {
        // ELM327 adapters typically use 38400 or higher
        if self.is_can() {
            115200
        } else {
            38400
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::J1850Pwm => "SAE J1850 PWM",
            Transport::J1850Vpw => "SAE J1850 VPW",
            Transport::Iso9141_2 => "ISO 9141-2",
            Transport::Iso14230_4Kwp => "ISO 14230-4 KWP (slow init)",
            Transport::Iso14230_4KwpFast => "ISO 14230-4 KWP (fast init)",
            Transport::Iso15765_4Can11bit500 => "ISO 15765-4 CAN 11/500",
            Transport::Iso15765_4Can29bit500 => "ISO 15765-4 CAN 29/500",
            Transport::Iso15765_4Can11bit250 => "ISO 15765-4 CAN 11/250",
            Transport::Iso15765_4Can29bit250 => "ISO 15765-4 CAN 29/250",
        };
        f.write_str(name)
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "j1850_pwm" | "j1850pwm" => Ok(Transport::J1850Pwm),
            "j1850_vpw" | "j1850vpw" => Ok(Transport::J1850Vpw),
            "iso9141_2" | "iso9141" => Ok(Transport::Iso9141_2),
            "iso14230_4_kwp" | "kwp" | "kwp_slow" => Ok(Transport::Iso14230_4Kwp),
            "iso14230_4_kwp_fast" | "kwp_fast" => Ok(Transport::Iso14230_4KwpFast),
            "iso15765_4_can11bit500" | "can11_500" => Ok(Transport::Iso15765_4Can11bit500),
            "iso15765_4_can29bit500" | "can29_500" => Ok(Transport::Iso15765_4Can29bit500),
            "iso15765_4_can11bit250" | "can11_250" => Ok(Transport::Iso15765_4Can11bit250),
            "iso15765_4_can29bit250" | "can29_250" => Ok(Transport::Iso15765_4Can29bit250),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elm_number_round_trip() {
        for transport in Transport::ALL {
            assert_eq!(
                Transport::from_elm_protocol_number(transport.elm_protocol_number()),
                Some(transport)
            );
        }
        assert_eq!(Transport::from_elm_protocol_number(0), None);
    }

    #[test]
    fn test_passthru_ids_and_flags() {
        assert_eq!(Transport::Iso15765_4Can11bit500.passthru_protocol_id(), 5);
        assert_eq!(Transport::Iso9141_2.passthru_protocol_id(), 3);
        assert_eq!(Transport::Iso15765_4Can11bit500.connect_flags(), 0);
        assert_eq!(Transport::Iso15765_4Can29bit250.connect_flags(), CAN_29BIT_ID);
        assert_eq!(Transport::Iso9141_2.bus_baud_rate(), 10_400);
    }

    #[test]
    fn test_parse_short_names() {
        assert_eq!("can11_500".parse(), Ok(Transport::Iso15765_4Can11bit500));
        assert_eq!("ISO9141".parse(), Ok(Transport::Iso9141_2));
        assert!("flexray".parse::<Transport>().is_err());
    }
}
