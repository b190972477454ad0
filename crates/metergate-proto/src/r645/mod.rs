//! R645 framing: the BCD-encoded register protocol.
//!
//! Wire layout of every frame:
//!
//! ```text
//! 0x68 | address (6, reversed BCD) | 0x68 | control | len | payload (len, +0x33) | cs | 0x16
//! ```
//!
//! The checksum is the mod-256 sum of every byte from the first 0x68 up to
//! but not including the checksum byte itself. [`Frame`] holds the payload
//! in plain form; the obfuscation offset is applied on encode and removed
//! on decode.

mod reader;
mod request;
mod response;

pub use reader::{FrameReader, ReaderEvent};
pub use request::{
    broadcast_time, read_address_request, read_request, relay_authenticated, relay_request,
    write_request, RelayCommand, REMOTE_CONTROL_DI,
};
pub use response::{decode_register_value, ErrorMask, RegisterValue, Response};

use crate::{
    codec,
    error::{CodecError, FrameError},
};

/// Frame start delimiter.
pub const START: u8 = 0x68;

/// Frame end delimiter.
pub const END: u8 = 0x16;

/// Shortest possible frame (empty payload).
pub const MIN_FRAME_LEN: usize = 12;

/// Longest payload the single length byte can declare.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Control code bitfield.
///
/// Bit 7 marks a response, bits 7+6 together an error response; the lower
/// six bits identify the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlCode(pub u8);

impl ControlCode {
    /// Broadcast time synchronisation.
    pub const BROADCAST_TIME: ControlCode = ControlCode(0x08);
    /// Register read.
    pub const READ: ControlCode = ControlCode(0x11);
    /// Address discovery.
    pub const READ_ADDRESS: ControlCode = ControlCode(0x13);
    /// Register write.
    pub const WRITE: ControlCode = ControlCode(0x14);
    /// Relay (load switch) control.
    pub const RELAY: ControlCode = ControlCode(0x1C);

    /// Whether bit 7 (response direction) is set.
    pub fn is_response(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Whether this is an error response (bits 7 and 6 both set).
    pub fn is_error(self) -> bool {
        self.0 & 0xC0 == 0xC0
    }

    /// Operation identifier in the lower six bits.
    pub fn function(self) -> u8 {
        self.0 & 0x3F
    }

    /// The normal response code for this request code.
    pub fn response(self) -> ControlCode {
        ControlCode(self.0 | 0x80)
    }

    /// The error response code for this request code.
    pub fn error_response(self) -> ControlCode {
        ControlCode(self.0 | 0xC0)
    }
}

/// A decoded R645 frame with the payload in plain (de-obfuscated) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 12-digit meter identity (or a broadcast form).
    pub address: String,
    /// Control code.
    pub control: ControlCode,
    /// Plain payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from its parts.
    pub fn new(address: impl Into<String>, control: ControlCode, payload: Vec<u8>) -> Self {
        Self { address: address.into(), control, payload }
    }

    /// Serialize to wire bytes: delimiters, reversed-BCD address, obfuscated
    /// payload, checksum.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong {
                length: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let address = codec::encode_address(&self.address)?;

        let mut out = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());
        out.push(START);
        out.extend_from_slice(&address);
        out.push(START);
        out.push(self.control.0);
        out.push(self.payload.len() as u8);

        let mut payload = self.payload.clone();
        codec::apply_offset(&mut payload);
        out.extend_from_slice(&payload);

        out.push(checksum(&out));
        out.push(END);
        Ok(out)
    }

    /// Decode one frame from the start of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed. The buffer must
    /// begin with the start delimiter; callers hunting for frame starts in a
    /// dirty stream use [`FrameReader`] instead.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
        if buf.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort { needed: MIN_FRAME_LEN, available: buf.len() });
        }
        if buf[0] != START {
            return Err(FrameError::BadDelimiter { offset: 0, expected: START, found: buf[0] });
        }
        if buf[7] != START {
            return Err(FrameError::BadDelimiter { offset: 7, expected: START, found: buf[7] });
        }

        let len = buf[9] as usize;
        let total = MIN_FRAME_LEN + len;
        if buf.len() < total {
            return Err(FrameError::TooShort { needed: total, available: buf.len() });
        }

        let computed = checksum(&buf[..10 + len]);
        let carried = buf[10 + len];
        if computed != carried {
            return Err(FrameError::ChecksumMismatch { computed, carried });
        }
        if buf[11 + len] != END {
            return Err(FrameError::BadDelimiter {
                offset: 11 + len,
                expected: END,
                found: buf[11 + len],
            });
        }

        let address = codec::decode_address(&buf[1..7])?;
        let mut payload = buf[10..10 + len].to_vec();
        codec::remove_offset(&mut payload);

        Ok((Frame { address, control: ControlCode(buf[8]), payload }, total))
    }
}

/// Mod-256 sum over `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Calendar timestamp used by the time-broadcast and authenticated relay
/// frames. Years are full (e.g. 2026); the wire form carries the last two
/// digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterDateTime {
    /// Full year.
    pub year: u16,
    /// Month 1..=12.
    pub month: u8,
    /// Day of month 1..=31.
    pub day: u8,
    /// Hour 0..=23.
    pub hour: u8,
    /// Minute 0..=59.
    pub minute: u8,
    /// Second 0..=59.
    pub second: u8,
}

impl MeterDateTime {
    /// BCD wire form, seconds first: `ss mm hh DD MM YY`.
    pub fn to_bcd(self) -> Result<[u8; 6], CodecError> {
        let yy = (self.year % 100) as u8;
        Ok([
            codec::pack_bcd(self.second / 10, self.second % 10)?,
            codec::pack_bcd(self.minute / 10, self.minute % 10)?,
            codec::pack_bcd(self.hour / 10, self.hour % 10)?,
            codec::pack_bcd(self.day / 10, self.day % 10)?,
            codec::pack_bcd(self.month / 10, self.month % 10)?,
            codec::pack_bcd(yy / 10, yy % 10)?,
        ])
    }
}
