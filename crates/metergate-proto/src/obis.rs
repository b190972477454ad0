//! OBIS object addresses and the gateway's OBIS registry.
//!
//! An OBIS code is six small integers `A-B:C.D.E.F`; on the wire it is six
//! consecutive bytes, optionally preceded by an 0x06 length tag. The
//! registry maps codes to display metadata and the scaler the egress mapper
//! applies to integer readings.

use std::{fmt, str::FromStr};

use crate::error::ApduError;

/// Wire width of an OBIS code.
pub const OBIS_LEN: usize = 6;

/// Six-part COSEM object address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObisCode(pub [u8; OBIS_LEN]);

impl ObisCode {
    /// Build from the six group values.
    pub fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self([a, b, c, d, e, f])
    }

    /// Decode from six wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ApduError> {
        if bytes.len() < OBIS_LEN {
            return Err(ApduError::Truncated { needed: OBIS_LEN, available: bytes.len() });
        }
        Ok(Self([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]))
    }

    /// The six wire bytes.
    pub fn as_bytes(&self) -> &[u8; OBIS_LEN] {
        &self.0
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}-{b}:{c}.{d}.{e}.{g}")
    }
}

impl FromStr for ObisCode {
    type Err = ApduError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u8> = s
            .split(['-', ':', '.'])
            .map(|part| part.parse::<u8>())
            .collect::<Result<_, _>>()
            .map_err(|_| ApduError::InvalidLength { reason: "OBIS group not a byte" })?;
        if parts.len() != OBIS_LEN {
            return Err(ApduError::InvalidLength { reason: "OBIS needs six groups" });
        }
        Ok(Self([parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]]))
    }
}

/// Broad classification used on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObisCategory {
    /// Cumulative energy registers.
    Energy,
    /// Instantaneous power.
    Power,
    /// Voltage.
    Voltage,
    /// Current.
    Current,
    /// Grid frequency.
    Frequency,
    /// Disconnect-control objects.
    Relay,
    /// Clock objects.
    Clock,
    /// Identity/name-plate objects.
    Identity,
}

/// Registry entry for one OBIS code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObisDescriptor {
    /// Printed OBIS code this entry matches.
    pub code: ObisCode,
    /// Stable key used on the bus.
    pub key: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Engineering unit, if any.
    pub unit: Option<&'static str>,
    /// Category for consumers that group readings.
    pub category: ObisCategory,
    /// Multiplier applied to integer readings, when fixed by convention.
    pub scaler: Option<f64>,
}

/// COSEM interface class ids the gateway speaks.
pub mod class {
    /// Data (class 1).
    pub const DATA: u16 = 1;
    /// Register (class 3).
    pub const REGISTER: u16 = 3;
    /// Disconnect control (class 70).
    pub const DISCONNECT_CONTROL: u16 = 70;
}

/// Disconnect-control object used by relay commands.
pub const DISCONNECT_CONTROL_OBIS: ObisCode = ObisCode([0, 0, 96, 3, 10, 255]);

/// The OBIS registry.
pub static OBIS_REGISTRY: &[ObisDescriptor] = &[
    ObisDescriptor {
        code: ObisCode([1, 0, 1, 8, 0, 255]),
        key: "ACTIVE_ENERGY_IMPORT",
        name: "Active energy import",
        unit: Some("kWh"),
        category: ObisCategory::Energy,
        scaler: Some(0.001),
    },
    ObisDescriptor {
        code: ObisCode([1, 0, 2, 8, 0, 255]),
        key: "ACTIVE_ENERGY_EXPORT",
        name: "Active energy export",
        unit: Some("kWh"),
        category: ObisCategory::Energy,
        scaler: Some(0.001),
    },
    ObisDescriptor {
        code: ObisCode([1, 0, 1, 7, 0, 255]),
        key: "ACTIVE_POWER",
        name: "Instantaneous active power",
        unit: Some("W"),
        category: ObisCategory::Power,
        scaler: None,
    },
    ObisDescriptor {
        code: ObisCode([1, 0, 32, 7, 0, 255]),
        key: "VOLTAGE_L1",
        name: "Voltage L1",
        unit: Some("V"),
        category: ObisCategory::Voltage,
        scaler: Some(0.1),
    },
    ObisDescriptor {
        code: ObisCode([1, 0, 52, 7, 0, 255]),
        key: "VOLTAGE_L2",
        name: "Voltage L2",
        unit: Some("V"),
        category: ObisCategory::Voltage,
        scaler: Some(0.1),
    },
    ObisDescriptor {
        code: ObisCode([1, 0, 72, 7, 0, 255]),
        key: "VOLTAGE_L3",
        name: "Voltage L3",
        unit: Some("V"),
        category: ObisCategory::Voltage,
        scaler: Some(0.1),
    },
    ObisDescriptor {
        code: ObisCode([1, 0, 31, 7, 0, 255]),
        key: "CURRENT_L1",
        name: "Current L1",
        unit: Some("A"),
        category: ObisCategory::Current,
        scaler: Some(0.001),
    },
    ObisDescriptor {
        code: ObisCode([1, 0, 51, 7, 0, 255]),
        key: "CURRENT_L2",
        name: "Current L2",
        unit: Some("A"),
        category: ObisCategory::Current,
        scaler: Some(0.001),
    },
    ObisDescriptor {
        code: ObisCode([1, 0, 71, 7, 0, 255]),
        key: "CURRENT_L3",
        name: "Current L3",
        unit: Some("A"),
        category: ObisCategory::Current,
        scaler: Some(0.001),
    },
    ObisDescriptor {
        code: ObisCode([1, 0, 14, 7, 0, 255]),
        key: "FREQUENCY",
        name: "Grid frequency",
        unit: Some("Hz"),
        category: ObisCategory::Frequency,
        scaler: Some(0.01),
    },
    ObisDescriptor {
        code: DISCONNECT_CONTROL_OBIS,
        key: "RELAY",
        name: "Supply disconnect control",
        unit: None,
        category: ObisCategory::Relay,
        scaler: None,
    },
    ObisDescriptor {
        code: ObisCode([0, 0, 1, 0, 0, 255]),
        key: "CLOCK",
        name: "Meter clock",
        unit: None,
        category: ObisCategory::Clock,
        scaler: None,
    },
    ObisDescriptor {
        code: ObisCode([0, 0, 96, 1, 0, 255]),
        key: "SERIAL_NUMBER",
        name: "Meter serial number",
        unit: None,
        category: ObisCategory::Identity,
        scaler: None,
    },
];

/// Look up a descriptor by OBIS code.
pub fn by_code(code: ObisCode) -> Option<&'static ObisDescriptor> {
    OBIS_REGISTRY.iter().find(|d| d.code == code)
}

/// Look up a descriptor by key, case-insensitively.
pub fn by_key(key: &str) -> Option<&'static ObisDescriptor> {
    OBIS_REGISTRY.iter().find(|d| d.key.eq_ignore_ascii_case(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let code = ObisCode::new(1, 0, 1, 8, 0, 255);
        assert_eq!(code.to_string(), "1-0:1.8.0.255");
        assert_eq!("1-0:1.8.0.255".parse::<ObisCode>().unwrap(), code);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("1-0:1.8.0".parse::<ObisCode>().is_err());
        assert!("1-0:1.8.0.999".parse::<ObisCode>().is_err());
        assert!("a-b:c.d.e.f".parse::<ObisCode>().is_err());
    }

    #[test]
    fn disconnect_control_address() {
        assert_eq!(DISCONNECT_CONTROL_OBIS.to_string(), "0-0:96.3.10.255");
        assert_eq!(by_code(DISCONNECT_CONTROL_OBIS).unwrap().category, ObisCategory::Relay);
    }

    #[test]
    fn registry_lookup() {
        let energy = by_key("active_energy_import").unwrap();
        assert_eq!(energy.unit, Some("kWh"));
        assert_eq!(energy.scaler, Some(0.001));
        assert!(by_code(ObisCode::new(9, 9, 9, 9, 9, 9)).is_none());
    }

    #[test]
    fn registry_keys_unique() {
        for (i, a) in OBIS_REGISTRY.iter().enumerate() {
            for b in &OBIS_REGISTRY[i + 1..] {
                assert_ne!(a.code, b.code);
                assert!(!a.key.eq_ignore_ascii_case(b.key), "duplicate key {}", a.key);
            }
        }
    }
}
