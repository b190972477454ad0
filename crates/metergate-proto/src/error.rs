//! Error types for the wire codecs.
//!
//! Strongly-typed errors per layer: `CodecError` for BCD/decimal/address
//! primitives, `FrameError` for R645 framing, `ApduError` for the COSEM
//! application layer. Stream parsers convert these into diagnostic events
//! at the connection boundary rather than propagating them upward.

use thiserror::Error;

/// Errors from the BCD/decimal/address codec primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A BCD nibble decoded to a value above 9.
    #[error("invalid BCD nibble in byte {byte:#04x}")]
    InvalidNibble {
        /// Offending byte
        byte: u8,
    },

    /// A digit outside '0'..='9' where a decimal string was required.
    #[error("non-digit character {found:?} in decimal string")]
    NonDigit {
        /// Offending character
        found: char,
    },

    /// Input length did not match the expected wire width.
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Expected byte count
        expected: usize,
        /// Actual byte count
        actual: usize,
    },

    /// A decimal value does not fit into the requested BCD width.
    #[error("value {value} does not fit in {bytes} BCD bytes")]
    ValueOutOfRange {
        /// Value that was rejected
        value: u64,
        /// Target width in bytes
        bytes: usize,
    },
}

/// Errors from R645 frame assembly and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than the 12-byte minimum or truncated mid-payload.
    #[error("frame too short: need {needed} bytes, have {available}")]
    TooShort {
        /// Bytes required to continue
        needed: usize,
        /// Bytes available in the buffer
        available: usize,
    },

    /// A fixed delimiter (0x68 / 0x16) was missing at its offset.
    #[error("bad delimiter at offset {offset}: expected {expected:#04x}, found {found:#04x}")]
    BadDelimiter {
        /// Offset of the delimiter within the frame
        offset: usize,
        /// Expected delimiter byte
        expected: u8,
        /// Byte actually present
        found: u8,
    },

    /// Modular checksum did not match the frame contents.
    #[error("checksum mismatch: computed {computed:#04x}, frame carries {carried:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the frame
        computed: u8,
        /// Checksum byte carried in the frame
        carried: u8,
    },

    /// Length byte exceeds the maximum frame payload.
    #[error("payload length {length} exceeds maximum {max}")]
    PayloadTooLong {
        /// Declared payload length
        length: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Response payload too short to carry the expected record.
    #[error("short payload: need {needed} bytes after offset removal, got {actual}")]
    ShortPayload {
        /// Bytes required
        needed: usize,
        /// Bytes present
        actual: usize,
    },

    /// Codec-level failure while assembling or decoding a frame field.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors from the COSEM APDU codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApduError {
    /// First byte is not a known APDU tag.
    #[error("unknown APDU tag {tag:#04x}")]
    UnknownTag {
        /// Offending tag byte
        tag: u8,
    },

    /// Buffer ends before the APDU does.
    #[error("truncated APDU: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to continue
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// BER-TLV length field malformed (reserved form or width outside 1..=4).
    #[error("invalid BER length encoding: {reason}")]
    InvalidLength {
        /// What made the length field unusable
        reason: &'static str,
    },

    /// A choice/selector byte carried a value outside its contract.
    #[error("invalid selector {value:#04x} in {context}")]
    InvalidSelector {
        /// Selector value found
        value: u8,
        /// APDU context the selector appeared in
        context: &'static str,
    },

    /// A DLMS data value carried an unknown type tag.
    #[error("unknown DLMS data tag {tag:#04x}")]
    UnknownDataTag {
        /// Offending data type tag
        tag: u8,
    },

    /// Heartbeat packet failed structural validation.
    #[error("malformed heartbeat packet: {reason}")]
    MalformedHeartbeat {
        /// What failed
        reason: &'static str,
    },
}
