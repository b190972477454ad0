//! R645 request frame builders.
//!
//! Builders return a plain [`Frame`]; obfuscation and checksum happen in
//! [`Frame::encode`]. The authenticated relay variant carries an
//! AES-128-ECB-encrypted credential block as the target firmware expects.

use aes::Aes128;
use cipher::{BlockEncrypt, KeyInit};

use super::{ControlCode, Frame, MeterDateTime};
use crate::{
    codec::{BROADCAST_NINES, BROADCAST_WILDCARD},
    error::FrameError,
};

/// Data identifier of the remote relay control point.
pub const REMOTE_CONTROL_DI: u32 = 0x0400_0501;

/// Relay operation carried in the control payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    /// Open the supply relay (disconnect the load).
    Trip,
    /// Close the supply relay (restore the load).
    Close,
}

impl RelayCommand {
    /// Command byte on the wire.
    pub fn code(self) -> u8 {
        match self {
            RelayCommand::Trip => 0x1A,
            RelayCommand::Close => 0x1B,
        }
    }
}

/// Read one register.
pub fn read_request(address: &str, di: u32) -> Frame {
    Frame::new(address, ControlCode::READ, di.to_le_bytes().to_vec())
}

/// Write one register: DI, then password and operator credentials, then the
/// BCD value.
pub fn write_request(
    address: &str,
    di: u32,
    value: &[u8],
    operator: [u8; 4],
    password: [u8; 4],
) -> Frame {
    let mut payload = Vec::with_capacity(12 + value.len());
    payload.extend_from_slice(&di.to_le_bytes());
    payload.extend_from_slice(&password);
    payload.extend_from_slice(&operator);
    payload.extend_from_slice(value);
    Frame::new(address, ControlCode::WRITE, payload)
}

/// Broadcast address discovery (single-meter wiring scenarios).
pub fn read_address_request() -> Frame {
    Frame::new(BROADCAST_WILDCARD, ControlCode::READ_ADDRESS, Vec::new())
}

/// Broadcast the gateway clock to every meter on the line. No response is
/// expected.
pub fn broadcast_time(now: MeterDateTime) -> Result<Frame, FrameError> {
    let bcd = now.to_bcd()?;
    Ok(Frame::new(BROADCAST_NINES, ControlCode::BROADCAST_TIME, bcd.to_vec()))
}

/// Simple (unauthenticated) relay control. Some meter firmware accepts this
/// form and some silently ignores it; callers treat success as "command
/// sent".
pub fn relay_request(address: &str, command: RelayCommand) -> Frame {
    let mut payload = Vec::with_capacity(5);
    payload.extend_from_slice(&REMOTE_CONTROL_DI.to_le_bytes());
    payload.push(command.code());
    Frame::new(address, ControlCode::RELAY, payload)
}

/// Authenticated relay control.
///
/// A 16-byte credential block (timestamp, operator, password, command byte,
/// one pad byte) is encrypted with AES-128 in ECB mode, single block, no
/// padding, and concatenated after the relay data identifier.
pub fn relay_authenticated(
    address: &str,
    command: RelayCommand,
    key: &[u8; 16],
    operator: [u8; 4],
    password: [u8; 4],
    timestamp: MeterDateTime,
) -> Result<Frame, FrameError> {
    let ts = timestamp.to_bcd()?;

    let mut block = [0u8; 16];
    block[..6].copy_from_slice(&ts);
    block[6..10].copy_from_slice(&operator);
    block[10..14].copy_from_slice(&password);
    block[14] = command.code();
    block[15] = 0x00;

    let cipher = Aes128::new(key.into());
    cipher.encrypt_block((&mut block).into());

    let mut payload = Vec::with_capacity(20);
    payload.extend_from_slice(&REMOTE_CONTROL_DI.to_le_bytes());
    payload.extend_from_slice(&block);
    Ok(Frame::new(address, ControlCode::RELAY, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_payload_is_di() {
        let frame = read_request("000000001234", 0x0201_0100);
        assert_eq!(frame.control, ControlCode::READ);
        assert_eq!(frame.payload, vec![0x00, 0x01, 0x01, 0x02]);
    }

    #[test]
    fn write_request_layout() {
        let frame = write_request(
            "000000001234",
            0x0400_0102,
            &[0x30, 0x25, 0x14],
            *b"op01",
            *b"pw01",
        );
        assert_eq!(frame.payload.len(), 4 + 4 + 4 + 3);
        assert_eq!(&frame.payload[..4], &0x0400_0102u32.to_le_bytes());
        assert_eq!(&frame.payload[4..8], b"pw01");
        assert_eq!(&frame.payload[8..12], b"op01");
    }

    #[test]
    fn address_discovery_is_broadcast() {
        let frame = read_address_request();
        assert_eq!(frame.address, BROADCAST_WILDCARD);
        assert!(frame.payload.is_empty());
        let wire = frame.encode().unwrap();
        assert_eq!(&wire[1..7], &[0xAA; 6]);
    }

    #[test]
    fn time_broadcast_addresses_all_meters() {
        let ts = MeterDateTime { year: 2026, month: 8, day: 1, hour: 0, minute: 0, second: 0 };
        let frame = broadcast_time(ts).unwrap();
        assert_eq!(frame.address, BROADCAST_NINES);
        assert_eq!(frame.control, ControlCode::BROADCAST_TIME);
        assert_eq!(frame.payload.len(), 6);
    }

    #[test]
    fn simple_relay_payload() {
        let frame = relay_request("000000001234", RelayCommand::Trip);
        assert_eq!(frame.payload[4], 0x1A);
        let frame = relay_request("000000001234", RelayCommand::Close);
        assert_eq!(frame.payload[4], 0x1B);
    }

    #[test]
    fn authenticated_relay_is_di_plus_one_block() {
        let ts = MeterDateTime { year: 2026, month: 1, day: 2, hour: 3, minute: 4, second: 5 };
        let frame = relay_authenticated(
            "000000001234",
            RelayCommand::Trip,
            &[0x42; 16],
            *b"op01",
            *b"pw01",
            ts,
        )
        .unwrap();
        assert_eq!(frame.payload.len(), 4 + 16);
        assert_eq!(&frame.payload[..4], &REMOTE_CONTROL_DI.to_le_bytes());

        // Ciphertext must differ from the plaintext credential block.
        let mut plain = [0u8; 16];
        plain[..6].copy_from_slice(&ts.to_bcd().unwrap());
        assert_ne!(&frame.payload[4..10], &plain[..6]);
    }

    #[test]
    fn authenticated_relay_is_deterministic() {
        let ts = MeterDateTime { year: 2026, month: 1, day: 2, hour: 3, minute: 4, second: 5 };
        let a = relay_authenticated(
            "000000001234",
            RelayCommand::Close,
            &[0x42; 16],
            *b"op01",
            *b"pw01",
            ts,
        )
        .unwrap();
        let b = relay_authenticated(
            "000000001234",
            RelayCommand::Close,
            &[0x42; 16],
            *b"op01",
            *b"pw01",
            ts,
        )
        .unwrap();
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }
}
