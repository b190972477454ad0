//! R645 register descriptor table.
//!
//! Every readable register is keyed by a 32-bit data identifier whose most
//! significant byte partitions the register space (0x00 cumulative energy,
//! 0x02 instantaneous, 0x04 parameters). Descriptors carry the metadata the
//! egress mapper needs to turn raw BCD integers into engineering units;
//! scaling itself happens exactly once, downstream of the decoder.

/// Register space partition derived from the DI's most significant byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSpace {
    /// Cumulative energy registers (DI high byte 0x00).
    Energy,
    /// Instantaneous measurement registers (DI high byte 0x02).
    Instantaneous,
    /// Parameter/configuration registers (DI high byte 0x04).
    Parameters,
    /// Anything else; decodable only as raw BCD.
    Reserved,
}

/// Partition a data identifier by its most significant byte.
pub fn space_of(di: u32) -> RegisterSpace {
    match (di >> 24) as u8 {
        0x00 => RegisterSpace::Energy,
        0x02 => RegisterSpace::Instantaneous,
        0x04 => RegisterSpace::Parameters,
        _ => RegisterSpace::Reserved,
    }
}

/// Static description of one readable register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDescriptor {
    /// 32-bit data identifier.
    pub di: u32,
    /// Stable key used on the bus and in command parameters.
    pub key: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Engineering unit, if any.
    pub unit: Option<&'static str>,
    /// Multiplier applied to the raw decimal value to reach the unit.
    pub resolution: f64,
    /// Value width on the wire in bytes (after the 4-byte DI).
    pub width: usize,
    /// Whether the MSB of the highest-order byte is a sign bit.
    pub signed: bool,
    /// Categorical value labels for enum-like registers.
    pub states: Option<&'static [(u64, &'static str)]>,
}

const RELAY_STATES: &[(u64, &'static str)] = &[(0, "closed"), (1, "open")];

/// The full descriptor table.
pub static REGISTERS: &[RegisterDescriptor] = &[
    // Cumulative energy (XXXXXX.XX)
    RegisterDescriptor {
        di: 0x0000_0000,
        key: "TOTAL_ACTIVE_ENERGY",
        name: "Total active energy",
        unit: Some("kWh"),
        resolution: 0.01,
        width: 4,
        signed: false,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0001_0000,
        key: "FORWARD_ACTIVE_ENERGY",
        name: "Forward active energy",
        unit: Some("kWh"),
        resolution: 0.01,
        width: 4,
        signed: false,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0002_0000,
        key: "REVERSE_ACTIVE_ENERGY",
        name: "Reverse active energy",
        unit: Some("kWh"),
        resolution: 0.01,
        width: 4,
        signed: false,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0003_0000,
        key: "FORWARD_REACTIVE_ENERGY",
        name: "Forward reactive energy",
        unit: Some("kvarh"),
        resolution: 0.01,
        width: 4,
        signed: false,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0004_0000,
        key: "REVERSE_REACTIVE_ENERGY",
        name: "Reverse reactive energy",
        unit: Some("kvarh"),
        resolution: 0.01,
        width: 4,
        signed: false,
        states: None,
    },
    // Instantaneous (phase voltages XXX.X, currents XXX.XXX, powers XX.XXXX)
    RegisterDescriptor {
        di: 0x0201_0100,
        key: "VOLTAGE_A",
        name: "Phase A voltage",
        unit: Some("V"),
        resolution: 0.1,
        width: 2,
        signed: false,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0201_0200,
        key: "VOLTAGE_B",
        name: "Phase B voltage",
        unit: Some("V"),
        resolution: 0.1,
        width: 2,
        signed: false,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0201_0300,
        key: "VOLTAGE_C",
        name: "Phase C voltage",
        unit: Some("V"),
        resolution: 0.1,
        width: 2,
        signed: false,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0202_0100,
        key: "CURRENT_A",
        name: "Phase A current",
        unit: Some("A"),
        resolution: 0.001,
        width: 3,
        signed: true,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0202_0200,
        key: "CURRENT_B",
        name: "Phase B current",
        unit: Some("A"),
        resolution: 0.001,
        width: 3,
        signed: true,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0202_0300,
        key: "CURRENT_C",
        name: "Phase C current",
        unit: Some("A"),
        resolution: 0.001,
        width: 3,
        signed: true,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0203_0000,
        key: "ACTIVE_POWER_TOTAL",
        name: "Total active power",
        unit: Some("kW"),
        resolution: 0.0001,
        width: 3,
        signed: true,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0204_0000,
        key: "REACTIVE_POWER_TOTAL",
        name: "Total reactive power",
        unit: Some("kvar"),
        resolution: 0.0001,
        width: 3,
        signed: true,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0206_0000,
        key: "POWER_FACTOR_TOTAL",
        name: "Total power factor",
        unit: None,
        resolution: 0.001,
        width: 2,
        signed: true,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0280_0002,
        key: "FREQUENCY",
        name: "Grid frequency",
        unit: Some("Hz"),
        resolution: 0.01,
        width: 2,
        signed: false,
        states: None,
    },
    // Parameters
    RegisterDescriptor {
        di: 0x0400_0101,
        key: "METER_DATE",
        name: "Meter calendar date",
        unit: None,
        resolution: 1.0,
        width: 4,
        signed: false,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0400_0102,
        key: "METER_TIME",
        name: "Meter clock time",
        unit: None,
        resolution: 1.0,
        width: 3,
        signed: false,
        states: None,
    },
    RegisterDescriptor {
        di: 0x0400_0503,
        key: "RELAY_STATE",
        name: "Supply relay state",
        unit: None,
        resolution: 1.0,
        width: 1,
        signed: false,
        states: Some(RELAY_STATES),
    },
];

/// Look up a descriptor by data identifier.
pub fn by_di(di: u32) -> Option<&'static RegisterDescriptor> {
    REGISTERS.iter().find(|r| r.di == di)
}

/// Look up a descriptor by key, case-insensitively.
pub fn by_key(key: &str) -> Option<&'static RegisterDescriptor> {
    REGISTERS.iter().find(|r| r.key.eq_ignore_ascii_case(key))
}

/// All descriptors in a given register space.
pub fn in_space(space: RegisterSpace) -> impl Iterator<Item = &'static RegisterDescriptor> {
    REGISTERS.iter().filter(move |r| space_of(r.di) == space)
}
