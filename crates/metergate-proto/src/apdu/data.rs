//! DLMS data-value codec.
//!
//! Values are tag-prefixed A-XDR: a one-byte type tag followed by a
//! type-specific body. The decoder always reports how many bytes it
//! consumed; APDU length inference depends on that count.

use crate::error::ApduError;

/// Parse a BER-style length field starting at `buf[0]`.
///
/// Short form: high bit clear, the byte is the length. Long form: the low
/// seven bits give the number of following big-endian length bytes (1..=4).
/// Returns `(length, bytes_consumed_by_the_field)`.
pub(crate) fn parse_length(buf: &[u8]) -> Result<(usize, usize), ApduError> {
    let Some(&first) = buf.first() else {
        return Err(ApduError::Truncated { needed: 1, available: 0 });
    };
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }
    let width = (first & 0x7F) as usize;
    if width == 0 || width > 4 {
        return Err(ApduError::InvalidLength { reason: "length-of-length outside 1..=4" });
    }
    if buf.len() < 1 + width {
        return Err(ApduError::Truncated { needed: 1 + width, available: buf.len() });
    }
    let mut length: usize = 0;
    for &byte in &buf[1..=width] {
        length = (length << 8) | byte as usize;
    }
    Ok((length, 1 + width))
}

/// Encode a BER-style length field.
pub(crate) fn encode_length(length: usize, out: &mut Vec<u8>) {
    if length < 0x80 {
        out.push(length as u8);
    } else {
        let bytes = length.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

/// COSEM date-time (12 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CosemDateTime {
    /// Full year, 0xFFFF when unspecified.
    pub year: u16,
    /// Month 1..=12, or 0xFF wildcard.
    pub month: u8,
    /// Day of month 1..=31, or 0xFF wildcard.
    pub day: u8,
    /// Day of week 1..=7, 0xFF wildcard.
    pub weekday: u8,
    /// Hour 0..=23, 0xFF wildcard.
    pub hour: u8,
    /// Minute 0..=59, 0xFF wildcard.
    pub minute: u8,
    /// Second 0..=59, 0xFF wildcard.
    pub second: u8,
    /// Hundredths of a second, 0xFF wildcard.
    pub hundredths: u8,
    /// UTC deviation in minutes, 0x8000 when unspecified.
    pub deviation: i16,
    /// Clock status bits.
    pub status: u8,
}

/// Wire width of a COSEM date-time.
pub const DATETIME_LEN: usize = 12;

impl CosemDateTime {
    /// Decode from exactly 12 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ApduError> {
        if bytes.len() < DATETIME_LEN {
            return Err(ApduError::Truncated { needed: DATETIME_LEN, available: bytes.len() });
        }
        Ok(Self {
            year: u16::from_be_bytes([bytes[0], bytes[1]]),
            month: bytes[2],
            day: bytes[3],
            weekday: bytes[4],
            hour: bytes[5],
            minute: bytes[6],
            second: bytes[7],
            hundredths: bytes[8],
            deviation: i16::from_be_bytes([bytes[9], bytes[10]]),
            status: bytes[11],
        })
    }

    /// Serialize to the 12-byte wire form.
    pub fn to_bytes(self) -> [u8; DATETIME_LEN] {
        let year = self.year.to_be_bytes();
        let deviation = self.deviation.to_be_bytes();
        [
            year[0],
            year[1],
            self.month,
            self.day,
            self.weekday,
            self.hour,
            self.minute,
            self.second,
            self.hundredths,
            deviation[0],
            deviation[1],
            self.status,
        ]
    }

    /// Heuristic plausibility check used to disambiguate optional embedded
    /// timestamps: every field either a wildcard or within calendar range.
    pub fn is_plausible(self) -> bool {
        let year_ok = self.year == 0xFFFF || (1990..=2155).contains(&self.year);
        let month_ok = self.month == 0xFF || (1..=12).contains(&self.month);
        let day_ok = self.day == 0xFF || (1..=31).contains(&self.day);
        let weekday_ok = self.weekday == 0xFF || self.weekday <= 7;
        let hour_ok = self.hour == 0xFF || self.hour < 24;
        let minute_ok = self.minute == 0xFF || self.minute < 60;
        let second_ok = self.second == 0xFF || self.second < 60;
        year_ok && month_ok && day_ok && weekday_ok && hour_ok && minute_ok && second_ok
    }
}

/// A decoded DLMS data value.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// null-data (tag 0).
    Null,
    /// array (tag 1): homogeneous element sequence.
    Array(Vec<DataValue>),
    /// structure (tag 2): heterogeneous field sequence.
    Structure(Vec<DataValue>),
    /// boolean (tag 3).
    Boolean(bool),
    /// bit-string (tag 4): bit count plus packed bytes.
    BitString {
        /// Number of valid bits.
        bits: usize,
        /// Packed bit bytes, MSB first.
        bytes: Vec<u8>,
    },
    /// double-long (tag 5), signed 32-bit.
    DoubleLong(i32),
    /// double-long-unsigned (tag 6).
    DoubleLongUnsigned(u32),
    /// octet-string (tag 9).
    OctetString(Vec<u8>),
    /// visible-string (tag 10).
    VisibleString(String),
    /// utf8-string (tag 12).
    Utf8String(String),
    /// bcd (tag 13).
    Bcd(u8),
    /// integer (tag 15), signed 8-bit.
    Integer(i8),
    /// long (tag 16), signed 16-bit.
    Long(i16),
    /// unsigned (tag 17).
    Unsigned(u8),
    /// long-unsigned (tag 18).
    LongUnsigned(u16),
    /// compact-array (tag 19): single-level element tag plus raw contents.
    CompactArray {
        /// Element type tag.
        element_tag: u8,
        /// Raw packed contents.
        contents: Vec<u8>,
    },
    /// long64 (tag 20), signed 64-bit.
    Long64(i64),
    /// long64-unsigned (tag 21).
    Long64Unsigned(u64),
    /// enum (tag 22).
    Enum(u8),
    /// float32 (tag 23).
    Float32(f32),
    /// float64 (tag 24).
    Float64(f64),
    /// date-time (tag 25).
    DateTime(CosemDateTime),
    /// date (tag 26), raw 5 bytes.
    Date([u8; 5]),
    /// time (tag 27), raw 4 bytes.
    Time([u8; 4]),
}

impl DataValue {
    /// Decode one value from the start of `buf`, returning the value and
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(DataValue, usize), ApduError> {
        let Some(&tag) = buf.first() else {
            return Err(ApduError::Truncated { needed: 1, available: 0 });
        };
        let body = &buf[1..];
        match tag {
            0x00 => Ok((DataValue::Null, 1)),
            0x01 | 0x02 => {
                let (count, len_used) = parse_length(body)?;
                let mut at = 1 + len_used;
                let mut elements = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let (element, used) = DataValue::decode(&buf[at..])
                        .map_err(|e| bump_truncation(e, at))?;
                    elements.push(element);
                    at += used;
                }
                let value = if tag == 0x01 {
                    DataValue::Array(elements)
                } else {
                    DataValue::Structure(elements)
                };
                Ok((value, at))
            },
            0x03 => {
                let b = fixed(body, 1)?;
                Ok((DataValue::Boolean(b[0] != 0), 2))
            },
            0x04 => {
                let (bits, len_used) = parse_length(body)?;
                let byte_count = bits.div_ceil(8);
                let start = 1 + len_used;
                let bytes = fixed(&buf[start..], byte_count)
                    .map_err(|e| bump_truncation(e, start))?;
                Ok((DataValue::BitString { bits, bytes: bytes.to_vec() }, start + byte_count))
            },
            0x05 => {
                let b = fixed(body, 4)?;
                Ok((DataValue::DoubleLong(i32::from_be_bytes([b[0], b[1], b[2], b[3]])), 5))
            },
            0x06 => {
                let b = fixed(body, 4)?;
                Ok((
                    DataValue::DoubleLongUnsigned(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
                    5,
                ))
            },
            0x09 | 0x0A | 0x0C => {
                let (count, len_used) = parse_length(body)?;
                let start = 1 + len_used;
                let bytes =
                    fixed(&buf[start..], count).map_err(|e| bump_truncation(e, start))?;
                let total = start + count;
                let value = match tag {
                    0x09 => DataValue::OctetString(bytes.to_vec()),
                    0x0A => DataValue::VisibleString(
                        String::from_utf8_lossy(bytes).into_owned(),
                    ),
                    _ => DataValue::Utf8String(String::from_utf8_lossy(bytes).into_owned()),
                };
                Ok((value, total))
            },
            0x0D => {
                let b = fixed(body, 1)?;
                Ok((DataValue::Bcd(b[0]), 2))
            },
            0x0F => {
                let b = fixed(body, 1)?;
                Ok((DataValue::Integer(b[0] as i8), 2))
            },
            0x10 => {
                let b = fixed(body, 2)?;
                Ok((DataValue::Long(i16::from_be_bytes([b[0], b[1]])), 3))
            },
            0x11 => {
                let b = fixed(body, 1)?;
                Ok((DataValue::Unsigned(b[0]), 2))
            },
            0x12 => {
                let b = fixed(body, 2)?;
                Ok((DataValue::LongUnsigned(u16::from_be_bytes([b[0], b[1]])), 3))
            },
            0x13 => {
                // Single-level contents description, then BER-counted bytes.
                let element = fixed(body, 1)?;
                let (count, len_used) = parse_length(&buf[2..])?;
                let start = 2 + len_used;
                let contents =
                    fixed(&buf[start..], count).map_err(|e| bump_truncation(e, start))?;
                Ok((
                    DataValue::CompactArray {
                        element_tag: element[0],
                        contents: contents.to_vec(),
                    },
                    start + count,
                ))
            },
            0x14 => {
                let b = fixed(body, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok((DataValue::Long64(i64::from_be_bytes(raw)), 9))
            },
            0x15 => {
                let b = fixed(body, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok((DataValue::Long64Unsigned(u64::from_be_bytes(raw)), 9))
            },
            0x16 => {
                let b = fixed(body, 1)?;
                Ok((DataValue::Enum(b[0]), 2))
            },
            0x17 => {
                let b = fixed(body, 4)?;
                Ok((DataValue::Float32(f32::from_be_bytes([b[0], b[1], b[2], b[3]])), 5))
            },
            0x18 => {
                let b = fixed(body, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok((DataValue::Float64(f64::from_be_bytes(raw)), 9))
            },
            0x19 => {
                let dt = CosemDateTime::from_bytes(body)?;
                Ok((DataValue::DateTime(dt), 1 + DATETIME_LEN))
            },
            0x1A => {
                let b = fixed(body, 5)?;
                Ok((DataValue::Date([b[0], b[1], b[2], b[3], b[4]]), 6))
            },
            0x1B => {
                let b = fixed(body, 4)?;
                Ok((DataValue::Time([b[0], b[1], b[2], b[3]]), 5))
            },
            other => Err(ApduError::UnknownDataTag { tag: other }),
        }
    }

    /// Serialize to the tag-prefixed wire form.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            DataValue::Null => out.push(0x00),
            DataValue::Array(elements) | DataValue::Structure(elements) => {
                out.push(if matches!(self, DataValue::Array(_)) { 0x01 } else { 0x02 });
                encode_length(elements.len(), out);
                for element in elements {
                    element.encode(out);
                }
            },
            DataValue::Boolean(v) => {
                out.push(0x03);
                out.push(u8::from(*v));
            },
            DataValue::BitString { bits, bytes } => {
                out.push(0x04);
                encode_length(*bits, out);
                out.extend_from_slice(bytes);
            },
            DataValue::DoubleLong(v) => {
                out.push(0x05);
                out.extend_from_slice(&v.to_be_bytes());
            },
            DataValue::DoubleLongUnsigned(v) => {
                out.push(0x06);
                out.extend_from_slice(&v.to_be_bytes());
            },
            DataValue::OctetString(bytes) => {
                out.push(0x09);
                encode_length(bytes.len(), out);
                out.extend_from_slice(bytes);
            },
            DataValue::VisibleString(s) => {
                out.push(0x0A);
                encode_length(s.len(), out);
                out.extend_from_slice(s.as_bytes());
            },
            DataValue::Utf8String(s) => {
                out.push(0x0C);
                encode_length(s.len(), out);
                out.extend_from_slice(s.as_bytes());
            },
            DataValue::Bcd(v) => {
                out.push(0x0D);
                out.push(*v);
            },
            DataValue::Integer(v) => {
                out.push(0x0F);
                out.push(*v as u8);
            },
            DataValue::Long(v) => {
                out.push(0x10);
                out.extend_from_slice(&v.to_be_bytes());
            },
            DataValue::Unsigned(v) => {
                out.push(0x11);
                out.push(*v);
            },
            DataValue::LongUnsigned(v) => {
                out.push(0x12);
                out.extend_from_slice(&v.to_be_bytes());
            },
            DataValue::CompactArray { element_tag, contents } => {
                out.push(0x13);
                out.push(*element_tag);
                encode_length(contents.len(), out);
                out.extend_from_slice(contents);
            },
            DataValue::Long64(v) => {
                out.push(0x14);
                out.extend_from_slice(&v.to_be_bytes());
            },
            DataValue::Long64Unsigned(v) => {
                out.push(0x15);
                out.extend_from_slice(&v.to_be_bytes());
            },
            DataValue::Enum(v) => {
                out.push(0x16);
                out.push(*v);
            },
            DataValue::Float32(v) => {
                out.push(0x17);
                out.extend_from_slice(&v.to_be_bytes());
            },
            DataValue::Float64(v) => {
                out.push(0x18);
                out.extend_from_slice(&v.to_be_bytes());
            },
            DataValue::DateTime(dt) => {
                out.push(0x19);
                out.extend_from_slice(&dt.to_bytes());
            },
            DataValue::Date(b) => {
                out.push(0x1A);
                out.extend_from_slice(b);
            },
            DataValue::Time(b) => {
                out.push(0x1B);
                out.extend_from_slice(b);
            },
        }
    }

    /// Integer view of numeric values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataValue::Boolean(v) => Some(i64::from(*v)),
            DataValue::DoubleLong(v) => Some(i64::from(*v)),
            DataValue::DoubleLongUnsigned(v) => Some(i64::from(*v)),
            DataValue::Bcd(v) | DataValue::Unsigned(v) | DataValue::Enum(v) => {
                Some(i64::from(*v))
            },
            DataValue::Integer(v) => Some(i64::from(*v)),
            DataValue::Long(v) => Some(i64::from(*v)),
            DataValue::LongUnsigned(v) => Some(i64::from(*v)),
            DataValue::Long64(v) => Some(*v),
            DataValue::Long64Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Floating-point view of numeric values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Float32(v) => Some(f64::from(*v)),
            DataValue::Float64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Boolean(v) => Some(*v),
            DataValue::Unsigned(v) | DataValue::Enum(v) => Some(*v != 0),
            _ => None,
        }
    }
}

fn fixed(buf: &[u8], len: usize) -> Result<&[u8], ApduError> {
    if buf.len() < len {
        return Err(ApduError::Truncated { needed: len, available: buf.len() });
    }
    Ok(&buf[..len])
}

/// Shift a nested truncation error's byte counts by the enclosing offset so
/// the outermost caller sees totals relative to the full buffer.
fn bump_truncation(err: ApduError, offset: usize) -> ApduError {
    match err {
        ApduError::Truncated { needed, available } => {
            ApduError::Truncated { needed: needed + offset, available: available + offset }
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn scalar_round_trips() {
        let cases = vec![
            DataValue::Null,
            DataValue::Boolean(true),
            DataValue::DoubleLong(-123_456),
            DataValue::DoubleLongUnsigned(4_000_000_000),
            DataValue::OctetString(vec![1, 2, 3]),
            DataValue::VisibleString("abc".to_string()),
            DataValue::Integer(-5),
            DataValue::Long(-3000),
            DataValue::Unsigned(200),
            DataValue::LongUnsigned(65_000),
            DataValue::Long64(-1),
            DataValue::Long64Unsigned(u64::from(u32::MAX) + 1),
            DataValue::Enum(7),
            DataValue::Float32(1.5),
            DataValue::Float64(-2.25),
        ];
        for value in cases {
            let mut wire = Vec::new();
            value.encode(&mut wire);
            let (decoded, used) = DataValue::decode(&wire).unwrap();
            assert_eq!(used, wire.len(), "consumed count for {value:?}");
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn structure_round_trip() {
        let value = DataValue::Structure(vec![
            DataValue::Boolean(false),
            DataValue::Enum(1),
            DataValue::Array(vec![DataValue::Unsigned(9), DataValue::Unsigned(10)]),
        ]);
        let mut wire = Vec::new();
        value.encode(&mut wire);
        let (decoded, used) = DataValue::decode(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(decoded, value);
    }

    #[test]
    fn truncated_scalar_reports_needed() {
        let wire = [0x06, 0x00, 0x01];
        let err = DataValue::decode(&wire).unwrap_err();
        assert!(matches!(err, ApduError::Truncated { needed: 4, available: 2 }));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            DataValue::decode(&[0x42, 0x00]),
            Err(ApduError::UnknownDataTag { tag: 0x42 })
        ));
    }

    #[test]
    fn ber_length_forms() {
        assert_eq!(parse_length(&[0x05]).unwrap(), (5, 1));
        assert_eq!(parse_length(&[0x81, 0x80]).unwrap(), (128, 2));
        assert_eq!(parse_length(&[0x82, 0x01, 0x00]).unwrap(), (256, 3));
        assert!(matches!(
            parse_length(&[0x85, 0, 0, 0, 0, 0]),
            Err(ApduError::InvalidLength { .. })
        ));
        assert!(matches!(parse_length(&[0x82, 0x01]), Err(ApduError::Truncated { .. })));
    }

    #[test]
    fn ber_length_encode_matches_parse() {
        for len in [0usize, 1, 127, 128, 255, 256, 65_535, 70_000] {
            let mut out = Vec::new();
            encode_length(len, &mut out);
            assert_eq!(parse_length(&out).unwrap(), (len, out.len()));
        }
    }

    #[test]
    fn datetime_plausibility() {
        let good = CosemDateTime {
            year: 2026,
            month: 8,
            day: 1,
            weekday: 6,
            hour: 10,
            minute: 30,
            second: 0,
            hundredths: 0,
            deviation: 0,
            status: 0,
        };
        assert!(good.is_plausible());

        let bad = CosemDateTime { month: 13, ..good };
        assert!(!bad.is_plausible());
        let bad = CosemDateTime { hour: 24, ..good };
        assert!(!bad.is_plausible());

        let wildcard = CosemDateTime {
            year: 0xFFFF,
            month: 0xFF,
            day: 0xFF,
            weekday: 0xFF,
            hour: 0xFF,
            minute: 0xFF,
            second: 0xFF,
            hundredths: 0xFF,
            deviation: 0,
            status: 0,
        };
        assert!(wildcard.is_plausible());
    }

    #[test]
    fn datetime_round_trip() {
        let dt = CosemDateTime {
            year: 2026,
            month: 8,
            day: 1,
            weekday: 6,
            hour: 10,
            minute: 30,
            second: 15,
            hundredths: 50,
            deviation: -480,
            status: 0x80,
        };
        let wire = dt.to_bytes();
        assert_eq!(CosemDateTime::from_bytes(&wire).unwrap(), dt);
    }

    proptest! {
        #[test]
        fn unsigned_round_trip(v in any::<u32>()) {
            let value = DataValue::DoubleLongUnsigned(v);
            let mut wire = Vec::new();
            value.encode(&mut wire);
            let (decoded, used) = DataValue::decode(&wire).unwrap();
            prop_assert_eq!(used, wire.len());
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn octet_string_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..300)) {
            let value = DataValue::OctetString(bytes);
            let mut wire = Vec::new();
            value.encode(&mut wire);
            let (decoded, used) = DataValue::decode(&wire).unwrap();
            prop_assert_eq!(used, wire.len());
            prop_assert_eq!(decoded, value);
        }
    }
}
