//! Vendor heartbeat (registration) packet parser.
//!
//! Every VW meter announces itself with a fixed 26-byte packet: an 11-byte
//! vendor prefix (lead byte 0x0A, the rest vendor-opaque session bytes),
//! twelve ASCII digits of meter identity, a separator byte and a two-byte
//! trailer. The identity `000000000000` is a factory default; policy for it
//! (accept or substitute the remote IP) lives with the connection registry.

use crate::error::ApduError;

/// Total heartbeat packet length.
pub const HEARTBEAT_LEN: usize = 26;

/// Lead byte of the vendor prefix.
pub const HEARTBEAT_LEAD: u8 = 0x0A;

/// Length of the vendor prefix.
const PREFIX_LEN: usize = 11;

/// Number of identity digits.
const ID_DIGITS: usize = 12;

/// The factory-default all-zero identity.
pub const ZERO_IDENTITY: &str = "000000000000";

/// Decoded heartbeat packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// 12-digit meter identity as announced.
    pub meter_id: String,
    /// Separator byte between identity and trailer.
    pub separator: u8,
    /// Two trailer bytes.
    pub trailer: [u8; 2],
}

impl Heartbeat {
    /// Whether the announced identity is the factory default.
    pub fn is_zero_identity(&self) -> bool {
        self.meter_id == ZERO_IDENTITY
    }
}

/// Whether `payload` has the length and lead byte of a heartbeat.
pub fn looks_like_heartbeat(payload: &[u8]) -> bool {
    payload.len() == HEARTBEAT_LEN && payload.first() == Some(&HEARTBEAT_LEAD)
}

/// Parse a 26-byte heartbeat packet.
pub fn parse(payload: &[u8]) -> Result<Heartbeat, ApduError> {
    if payload.len() != HEARTBEAT_LEN {
        return Err(ApduError::MalformedHeartbeat { reason: "length is not 26 bytes" });
    }
    if payload[0] != HEARTBEAT_LEAD {
        return Err(ApduError::MalformedHeartbeat { reason: "missing 0x0a lead byte" });
    }

    let id_bytes = &payload[PREFIX_LEN..PREFIX_LEN + ID_DIGITS];
    if !id_bytes.iter().all(u8::is_ascii_digit) {
        return Err(ApduError::MalformedHeartbeat { reason: "identity is not ASCII digits" });
    }
    // INVARIANT: all bytes are ASCII digits, so UTF-8 conversion cannot fail.
    let meter_id = String::from_utf8_lossy(id_bytes).into_owned();

    Ok(Heartbeat {
        meter_id,
        separator: payload[PREFIX_LEN + ID_DIGITS],
        trailer: [payload[24], payload[25]],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(meter_id: &str) -> Vec<u8> {
        let mut out = vec![HEARTBEAT_LEAD];
        out.extend_from_slice(&[0x00; PREFIX_LEN - 1]);
        out.extend_from_slice(meter_id.as_bytes());
        out.push(0x2C);
        out.extend_from_slice(&[0x0D, 0x0A]);
        out
    }

    #[test]
    fn parse_valid_heartbeat() {
        let wire = sample("000000001234");
        assert!(looks_like_heartbeat(&wire));
        let hb = parse(&wire).unwrap();
        assert_eq!(hb.meter_id, "000000001234");
        assert_eq!(hb.separator, 0x2C);
        assert_eq!(hb.trailer, [0x0D, 0x0A]);
        assert!(!hb.is_zero_identity());
    }

    #[test]
    fn zero_identity_flagged() {
        let hb = parse(&sample(ZERO_IDENTITY)).unwrap();
        assert!(hb.is_zero_identity());
    }

    #[test]
    fn wrong_length_rejected() {
        let mut wire = sample("000000001234");
        wire.pop();
        assert!(!looks_like_heartbeat(&wire));
        assert!(matches!(parse(&wire), Err(ApduError::MalformedHeartbeat { .. })));
    }

    #[test]
    fn wrong_lead_byte_rejected() {
        let mut wire = sample("000000001234");
        wire[0] = 0x0B;
        assert!(matches!(
            parse(&wire),
            Err(ApduError::MalformedHeartbeat { reason: "missing 0x0a lead byte" })
        ));
    }

    #[test]
    fn non_digit_identity_rejected() {
        let mut wire = sample("00000000123X");
        assert!(matches!(
            parse(&wire),
            Err(ApduError::MalformedHeartbeat { reason: "identity is not ASCII digits" })
        ));
        wire[11] = 0xFF;
        assert!(parse(&wire).is_err());
    }
}
