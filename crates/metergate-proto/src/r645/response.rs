//! Typed decoding of R645 response frames.

use super::{ControlCode, Frame};
use crate::{
    codec,
    error::FrameError,
    registers::{self, RegisterDescriptor},
};

/// Bitmask carried in the data byte of an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorMask(pub u8);

impl ErrorMask {
    /// Unspecified meter-side error.
    pub const OTHER: u8 = 0x01;
    /// No data for the requested identifier.
    pub const NO_DATA: u8 = 0x02;
    /// Password or authorization failure.
    pub const AUTH: u8 = 0x04;
    /// Baud rate cannot be changed.
    pub const RATE_UNCHANGEABLE: u8 = 0x08;
    /// Annual time-zone table limit exceeded.
    pub const ANNUAL_LIMIT: u8 = 0x10;
    /// Daily slot table limit exceeded.
    pub const DAILY_LIMIT: u8 = 0x20;
    /// Command execution failed.
    pub const COMMAND_FAILED: u8 = 0x40;

    /// Human-readable labels for every set bit.
    pub fn describe(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.0 & Self::OTHER != 0 {
            out.push("other error");
        }
        if self.0 & Self::NO_DATA != 0 {
            out.push("no requested data");
        }
        if self.0 & Self::AUTH != 0 {
            out.push("password/authorization failure");
        }
        if self.0 & Self::RATE_UNCHANGEABLE != 0 {
            out.push("baud rate unchangeable");
        }
        if self.0 & Self::ANNUAL_LIMIT != 0 {
            out.push("annual zone limit exceeded");
        }
        if self.0 & Self::DAILY_LIMIT != 0 {
            out.push("daily slot limit exceeded");
        }
        if self.0 & Self::COMMAND_FAILED != 0 {
            out.push("command failed");
        }
        if out.is_empty() {
            out.push("unknown error");
        }
        out
    }

    /// Joined description, e.g. for the bus error field.
    pub fn message(self) -> String {
        self.describe().join(", ")
    }
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Register read response carrying a data identifier and value bytes.
    Read {
        /// Responding meter identity.
        address: String,
        /// Decoded register value.
        value: RegisterValue,
    },
    /// Write acknowledgement (empty payload).
    WriteAck {
        /// Responding meter identity.
        address: String,
    },
    /// Relay command acknowledgement.
    RelayAck {
        /// Responding meter identity.
        address: String,
    },
    /// Address-discovery response; the payload repeats the meter identity.
    Address {
        /// Identity decoded from the response payload.
        address: String,
    },
    /// Error response with the condition bitmask.
    Error {
        /// Responding meter identity.
        address: String,
        /// Condition bitmask.
        mask: ErrorMask,
    },
}

impl Response {
    /// Classify and decode a response frame.
    ///
    /// # Errors
    ///
    /// `FrameError::ShortPayload` when the payload cannot carry the record
    /// its control code promises; `FrameError::BadDelimiter` never occurs
    /// here (framing is already validated).
    pub fn from_frame(frame: &Frame) -> Result<Response, FrameError> {
        if frame.control.is_error() {
            let mask = frame.payload.first().copied().unwrap_or(0);
            return Ok(Response::Error {
                address: frame.address.clone(),
                mask: ErrorMask(mask),
            });
        }

        match ControlCode(frame.control.function()) {
            ControlCode::READ => {
                if frame.payload.len() < 4 {
                    return Err(FrameError::ShortPayload {
                        needed: 4,
                        actual: frame.payload.len(),
                    });
                }
                let di = u32::from_le_bytes([
                    frame.payload[0],
                    frame.payload[1],
                    frame.payload[2],
                    frame.payload[3],
                ]);
                let value = decode_register_value(di, &frame.payload[4..])?;
                Ok(Response::Read { address: frame.address.clone(), value })
            },
            ControlCode::WRITE => Ok(Response::WriteAck { address: frame.address.clone() }),
            ControlCode::RELAY => Ok(Response::RelayAck { address: frame.address.clone() }),
            ControlCode::READ_ADDRESS => {
                if frame.payload.len() < codec::ADDRESS_LEN {
                    return Err(FrameError::ShortPayload {
                        needed: codec::ADDRESS_LEN,
                        actual: frame.payload.len(),
                    });
                }
                let address = codec::decode_address(&frame.payload[..codec::ADDRESS_LEN])?;
                Ok(Response::Address { address })
            },
            // Unknown operations still decode as a raw read so the value is
            // not lost; the egress layer flags the unknown key.
            _ => {
                if frame.payload.len() < 4 {
                    return Err(FrameError::ShortPayload {
                        needed: 4,
                        actual: frame.payload.len(),
                    });
                }
                let di = u32::from_le_bytes([
                    frame.payload[0],
                    frame.payload[1],
                    frame.payload[2],
                    frame.payload[3],
                ]);
                let value = decode_register_value(di, &frame.payload[4..])?;
                Ok(Response::Read { address: frame.address.clone(), value })
            },
        }
    }
}

/// A register value split into raw and descriptor-derived parts.
///
/// Scaling metadata travels alongside the raw value; the multiplication to
/// engineering units happens once, in the egress mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterValue {
    /// Data identifier the value belongs to.
    pub di: u32,
    /// Descriptor, when the identifier is known.
    pub descriptor: Option<&'static RegisterDescriptor>,
    /// Raw decimal value (sign applied when the descriptor says so).
    pub raw: i64,
    /// Categorical label when the descriptor defines states.
    pub state: Option<&'static str>,
}

impl RegisterValue {
    /// Stable key for the bus: descriptor key or the hex identifier.
    pub fn key(&self) -> String {
        match self.descriptor {
            Some(d) => d.key.to_string(),
            None => format!("{:08X}", self.di),
        }
    }

    /// Engineering-unit value, `None` for unknown identifiers.
    pub fn scaled(&self) -> Option<f64> {
        self.descriptor.map(|d| self.raw as f64 * d.resolution)
    }

    /// Unit label from the descriptor.
    pub fn unit(&self) -> Option<&'static str> {
        self.descriptor.and_then(|d| d.unit)
    }
}

/// Decode the value bytes that follow a data identifier.
///
/// Known identifiers decode per their descriptor (width and signedness);
/// unknown identifiers fall back to unsigned raw BCD with no scaling.
pub fn decode_register_value(di: u32, value: &[u8]) -> Result<RegisterValue, FrameError> {
    let descriptor = registers::by_di(di);

    let raw = match descriptor {
        Some(d) if d.signed => codec::decode_signed_decimal(value, true)?,
        _ => codec::decode_decimal(value, true)? as i64,
    };

    let state = descriptor
        .and_then(|d| d.states)
        .and_then(|states| states.iter().find(|(v, _)| *v == raw as u64))
        .map(|(_, label)| *label);

    Ok(RegisterValue { di, descriptor, raw, state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r645::read_request;

    fn response_frame(address: &str, di: u32, value: &[u8]) -> Frame {
        let mut payload = di.to_le_bytes().to_vec();
        payload.extend_from_slice(value);
        Frame::new(address, ControlCode::READ.response(), payload)
    }

    #[test]
    fn voltage_read_response() {
        let frame = response_frame("000000001234", 0x0201_0100, &[0x05, 0x22]);
        let response = Response::from_frame(&frame).unwrap();
        match response {
            Response::Read { address, value } => {
                assert_eq!(address, "000000001234");
                assert_eq!(value.key(), "VOLTAGE_A");
                assert_eq!(value.raw, 2205);
                assert!((value.scaled().unwrap() - 220.5).abs() < 1e-9);
                assert_eq!(value.unit(), Some("V"));
            },
            other => panic!("expected read response, got {other:?}"),
        }
    }

    #[test]
    fn energy_read_response_scaling() {
        let frame = response_frame("000000001234", 0x0000_0000, &[0x67, 0x45, 0x23, 0x01]);
        let Response::Read { value, .. } = Response::from_frame(&frame).unwrap() else {
            panic!("expected read response");
        };
        assert_eq!(value.raw, 1_234_567);
        assert!((value.scaled().unwrap() - 12_345.67).abs() < 1e-9);
        assert_eq!(value.unit(), Some("kWh"));
    }

    #[test]
    fn unknown_di_stays_raw() {
        let frame = response_frame("000000001234", 0x0999_0000, &[0x42, 0x00]);
        let Response::Read { value, .. } = Response::from_frame(&frame).unwrap() else {
            panic!("expected read response");
        };
        assert!(value.descriptor.is_none());
        assert_eq!(value.raw, 42);
        assert_eq!(value.scaled(), None);
        assert_eq!(value.key(), "09990000");
    }

    #[test]
    fn error_response_bitmask() {
        let frame = Frame::new(
            "000000001234",
            ControlCode::READ.error_response(),
            vec![ErrorMask::AUTH],
        );
        assert_eq!(frame.control.0, 0xD1);
        let Response::Error { mask, .. } = Response::from_frame(&frame).unwrap() else {
            panic!("expected error response");
        };
        assert_eq!(mask.0, 0x04);
        assert!(mask.message().contains("password"));
    }

    #[test]
    fn error_mask_combinations() {
        let mask = ErrorMask(ErrorMask::NO_DATA | ErrorMask::COMMAND_FAILED);
        let msg = mask.message();
        assert!(msg.contains("no requested data"));
        assert!(msg.contains("command failed"));
        assert!(ErrorMask(0).message().contains("unknown"));
    }

    #[test]
    fn relay_state_decodes_label() {
        let value = decode_register_value(0x0400_0503, &[0x01]).unwrap();
        assert_eq!(value.state, Some("open"));
    }

    #[test]
    fn short_payload_rejected() {
        let frame = Frame::new("000000001234", ControlCode::READ.response(), vec![0x00, 0x01]);
        assert!(matches!(
            Response::from_frame(&frame),
            Err(FrameError::ShortPayload { needed: 4, actual: 2 })
        ));
    }

    #[test]
    fn request_response_addresses_match() {
        // A response built from a request frame keeps address and control
        // relationship intact.
        let request = read_request("000000001234", 0x0201_0100);
        let response = response_frame("000000001234", 0x0201_0100, &[0x05, 0x22]);
        assert_eq!(request.address, response.address);
        assert_eq!(response.control, request.control.response());
    }
}
