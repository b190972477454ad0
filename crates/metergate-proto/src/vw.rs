//! VW wrapper framing and the stateful stream parser.
//!
//! The VW transport prefixes every packet with an 8-byte header: version,
//! source, destination and payload length, all big-endian u16. Some meter
//! firmware skips the wrapper entirely and writes bare APDUs, and cheap
//! serial converters inject noise, so the stream parser accepts wrapped
//! packets, raw APDUs and garbage in a single byte stream and
//! resynchronizes on the next plausible packet start.

use bytes::{Buf, Bytes, BytesMut};

use crate::{apdu, error::ApduError};

/// Wire width of the wrapper header.
pub const HEADER_LEN: usize = 8;

/// The only wrapper version on the wire.
pub const VERSION: u16 = 0x0001;

/// Maximum payload a header may declare; larger values are framing errors.
pub const MAX_PAYLOAD: usize = 4096;

/// First four header bytes of every wrapped packet (version 1, source 1).
pub const SIGNATURE: [u8; 4] = [0x00, 0x01, 0x00, 0x01];

/// Destination shared by the heartbeat endpoint and the DLMS endpoint;
/// payload content disambiguates.
pub const DLMS_DESTINATION: u16 = 0x0001;

/// Heartbeat payloads start with this byte.
pub const HEARTBEAT_LEAD: u8 = 0x0A;

/// Number of discarded bytes included in diagnostic previews.
const PREVIEW_LEN: usize = 32;

/// Decoded wrapper header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VwHeader {
    /// Wrapper version (always 0x0001).
    pub version: u16,
    /// Source wPort.
    pub source: u16,
    /// Destination wPort.
    pub destination: u16,
    /// Payload length in bytes.
    pub length: u16,
}

impl VwHeader {
    /// Decode from the first eight buffer bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, ApduError> {
        if buf.len() < HEADER_LEN {
            return Err(ApduError::Truncated { needed: HEADER_LEN, available: buf.len() });
        }
        Ok(Self {
            version: u16::from_be_bytes([buf[0], buf[1]]),
            source: u16::from_be_bytes([buf[2], buf[3]]),
            destination: u16::from_be_bytes([buf[4], buf[5]]),
            length: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    /// Serialize to the eight wire bytes.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..4].copy_from_slice(&self.source.to_be_bytes());
        out[4..6].copy_from_slice(&self.destination.to_be_bytes());
        out[6..8].copy_from_slice(&self.length.to_be_bytes());
        out
    }
}

/// One framed unit from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VwPacket {
    /// Wrapper header; synthetic (`source = destination = 0x0001`) for raw
    /// APDUs.
    pub header: VwHeader,
    /// Payload bytes (the full APDU for raw packets).
    pub payload: Bytes,
    /// Whether the packet arrived without a wrapper.
    pub is_raw: bool,
}

impl VwPacket {
    /// Whether the payload looks like a heartbeat registration packet.
    pub fn is_heartbeat(&self) -> bool {
        self.payload.first() == Some(&HEARTBEAT_LEAD)
    }
}

/// Events emitted by [`StreamParser::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete packet (wrapped or raw).
    Packet(VwPacket),
    /// Bytes were discarded during resynchronization.
    Discard {
        /// Hex preview of (up to) the first 32 discarded bytes.
        preview: String,
        /// Why the bytes were dropped.
        reason: String,
    },
}

/// Accumulating stream parser for one connection.
///
/// The emitted packet sequence is independent of how the stream is chunked;
/// partial packets stay buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: BytesMut,
}

impl StreamParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered state (new connection).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append a chunk and emit every packet that completes.
    pub fn push(&mut self, data: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            let Some(&first) = self.buf.first() else {
                break;
            };

            if first == 0x00 {
                if !self.parse_wrapped(&mut events) {
                    break;
                }
            } else if apdu::is_known_tag(first) {
                if !self.parse_raw(&mut events) {
                    break;
                }
            } else {
                self.resynchronize(1, "unrecognized leading byte", &mut events);
            }
        }

        events
    }

    /// Attempt to frame a wrapped packet at the buffer start. Returns
    /// `false` when more bytes are needed.
    fn parse_wrapped(&mut self, events: &mut Vec<StreamEvent>) -> bool {
        let available = self.buf.len().min(SIGNATURE.len());
        if self.buf[..available] != SIGNATURE[..available] {
            self.resynchronize(1, "bad wrapper signature", events);
            return true;
        }
        if self.buf.len() < HEADER_LEN {
            return false;
        }

        // INVARIANT: parse cannot fail, HEADER_LEN bytes are present.
        let Ok(header) = VwHeader::parse(&self.buf) else {
            return false;
        };

        if header.length as usize > MAX_PAYLOAD {
            events.push(discard_event(&self.buf[..1], "wrapper payload length over 4096"));
            self.buf.advance(1);
            return true;
        }

        let total = HEADER_LEN + header.length as usize;
        if self.buf.len() < total {
            return false;
        }

        let payload = Bytes::copy_from_slice(&self.buf[HEADER_LEN..total]);
        self.buf.advance(total);
        events.push(StreamEvent::Packet(VwPacket { header, payload, is_raw: false }));
        true
    }

    /// Attempt to frame a raw APDU at the buffer start. Returns `false`
    /// when more bytes are needed.
    fn parse_raw(&mut self, events: &mut Vec<StreamEvent>) -> bool {
        match apdu::infer_length(&self.buf) {
            Ok(Some(length)) => {
                if self.buf.len() < length {
                    return false;
                }
                let payload = Bytes::copy_from_slice(&self.buf[..length]);
                self.buf.advance(length);
                events.push(StreamEvent::Packet(VwPacket {
                    header: VwHeader {
                        version: VERSION,
                        source: 0x0001,
                        destination: 0x0001,
                        length: payload.len() as u16,
                    },
                    payload,
                    is_raw: true,
                }));
                true
            },
            Ok(None) => {
                if self.buf.len() > HEADER_LEN + MAX_PAYLOAD {
                    // Indeterminate past the safety cap: treat the lead byte
                    // as noise.
                    events.push(discard_event(&self.buf[..1], "indeterminate APDU over cap"));
                    self.buf.advance(1);
                    return true;
                }
                false
            },
            Err(err) => {
                self.resynchronize(1, &err.to_string(), events);
                true
            },
        }
    }

    /// Drop bytes up to the next plausible packet start at index >= `from`,
    /// or the whole buffer when none exists.
    fn resynchronize(&mut self, from: usize, reason: &str, events: &mut Vec<StreamEvent>) {
        let candidate = (from..self.buf.len()).find(|&i| {
            let byte = self.buf[i];
            if apdu::is_known_tag(byte) {
                return true;
            }
            if byte != 0x00 {
                return false;
            }
            // Candidate if the remaining bytes are a prefix of the wrapper
            // signature (a partial signature at the tail must be kept).
            let tail = &self.buf[i..];
            let check = tail.len().min(SIGNATURE.len());
            tail[..check] == SIGNATURE[..check]
        });

        match candidate {
            Some(i) => {
                tracing::debug!(dropped = i, reason, "stream resynchronized");
                events.push(discard_event(&self.buf[..i], reason));
                self.buf.advance(i);
            },
            None => {
                tracing::debug!(dropped = self.buf.len(), reason, "stream buffer discarded");
                events.push(discard_event(&self.buf, reason));
                self.buf.clear();
            },
        }
    }
}

/// Prepend the wrapper header to an outbound payload.
pub fn wrap(destination: u16, payload: &[u8]) -> Vec<u8> {
    let header = VwHeader {
        version: VERSION,
        source: 0x0001,
        destination,
        length: payload.len() as u16,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Prepare an outbound APDU, optionally skipping the wrapper for meters
/// that expect bare APDUs.
pub fn prepare(apdu_bytes: Vec<u8>, wrap_outgoing: bool, destination: u16) -> Vec<u8> {
    if wrap_outgoing {
        wrap(destination, &apdu_bytes)
    } else {
        apdu_bytes
    }
}

fn discard_event(bytes: &[u8], reason: &str) -> StreamEvent {
    let preview = bytes
        .iter()
        .take(PREVIEW_LEN)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    StreamEvent::Discard { preview, reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apdu::{encode_get_request, tag},
        obis::{class, ObisCode},
    };

    fn wrapped_packet(payload: &[u8]) -> Vec<u8> {
        wrap(DLMS_DESTINATION, payload)
    }

    fn raw_get_request() -> Vec<u8> {
        encode_get_request(0x10, class::REGISTER, ObisCode::new(1, 0, 1, 8, 0, 255), 2)
    }

    fn packets(events: &[StreamEvent]) -> Vec<&VwPacket> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Packet(p) => Some(p),
                StreamEvent::Discard { .. } => None,
            })
            .collect()
    }

    #[test]
    fn wrapped_packet_round_trip() {
        let payload = raw_get_request();
        let wire = wrapped_packet(&payload);
        assert_eq!(wire.len(), HEADER_LEN + 13);

        let mut parser = StreamParser::new();
        let events = parser.push(&wire);
        let got = packets(&events);
        assert_eq!(got.len(), 1);
        assert!(!got[0].is_raw);
        assert_eq!(got[0].header.destination, DLMS_DESTINATION);
        assert_eq!(&got[0].payload[..], &payload[..]);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn raw_apdu_gets_synthetic_header() {
        let payload = raw_get_request();
        let mut parser = StreamParser::new();
        let events = parser.push(&payload);
        let got = packets(&events);
        assert_eq!(got.len(), 1);
        assert!(got[0].is_raw);
        assert_eq!(got[0].header.source, 0x0001);
        assert_eq!(got[0].header.destination, 0x0001);
        assert_eq!(&got[0].payload[..], &payload[..]);
    }

    #[test]
    fn oversize_length_is_a_framing_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&SIGNATURE);
        wire.extend_from_slice(&0x0001u16.to_be_bytes());
        wire.extend_from_slice(&5000u16.to_be_bytes());
        // Follow with a valid raw APDU so resynchronization has a target.
        wire.extend_from_slice(&raw_get_request());

        let mut parser = StreamParser::new();
        let events = parser.push(&wire);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Discard { reason, .. } if reason.contains("4096"))));
        assert_eq!(packets(&events).len(), 1);
    }

    #[test]
    fn garbage_mixed_stream_any_chunking() {
        let p1 = wrapped_packet(&[tag::EXCEPTION, 0x01, 0x02, 0x00, 0x00, 0x00]);
        let a2 = raw_get_request();
        let p3 = wrapped_packet(&[tag::EXCEPTION, 0x02, 0x03, 0x00, 0x00, 0x00]);

        let mut wire = vec![0xDE, 0xAD, 0x55, 0x66];
        wire.extend_from_slice(&p1);
        wire.extend_from_slice(&a2);
        wire.extend_from_slice(&[0x99, 0x98]);
        wire.extend_from_slice(&p3);

        for chunk_size in [1usize, 2, 3, 5, 7, 11, wire.len()] {
            let mut parser = StreamParser::new();
            let mut events = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                events.extend(parser.push(chunk));
            }

            let got = packets(&events);
            assert_eq!(got.len(), 3, "chunk size {chunk_size}");
            assert_eq!(&got[0].payload[..], &p1[HEADER_LEN..], "chunk size {chunk_size}");
            assert_eq!(&got[1].payload[..], &a2[..], "chunk size {chunk_size}");
            assert_eq!(&got[2].payload[..], &p3[HEADER_LEN..], "chunk size {chunk_size}");

            let discarded: usize = events
                .iter()
                .filter(|e| matches!(e, StreamEvent::Discard { .. }))
                .count();
            assert!(discarded >= 2, "chunk size {chunk_size}: {discarded} discards");
            assert_eq!(parser.buffered(), 0, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn partial_signature_at_tail_is_kept() {
        let mut parser = StreamParser::new();
        let events = parser.push(&[0x42, 0x00, 0x01]);
        // Garbage byte dropped, possible signature prefix retained.
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Discard { preview, .. } if preview == "42"));
        assert_eq!(parser.buffered(), 2);

        // Completing the packet emits it.
        let rest = {
            let full = wrapped_packet(&[tag::EXCEPTION, 0x01, 0x02]);
            full[2..].to_vec()
        };
        let events = parser.push(&rest);
        assert_eq!(packets(&events).len(), 1);
    }

    #[test]
    fn pure_garbage_is_discarded_whole() {
        let mut parser = StreamParser::new();
        let events = parser.push(&[0x41, 0x42, 0x43]);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Discard { preview, .. } if preview == "41 42 43"));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn heartbeat_payload_detection() {
        let mut payload = vec![HEARTBEAT_LEAD];
        payload.extend_from_slice(&[0u8; 25]);
        let wire = wrapped_packet(&payload);
        let mut parser = StreamParser::new();
        let events = parser.push(&wire);
        let got = packets(&events);
        assert_eq!(got.len(), 1);
        assert!(got[0].is_heartbeat());
    }

    #[test]
    fn prepare_respects_wrap_flag() {
        let apdu_bytes = raw_get_request();
        let wrapped = prepare(apdu_bytes.clone(), true, 0x0001);
        assert_eq!(wrapped.len(), HEADER_LEN + apdu_bytes.len());
        assert_eq!(&wrapped[..4], &SIGNATURE);
        let bare = prepare(apdu_bytes.clone(), false, 0x0001);
        assert_eq!(bare, apdu_bytes);
    }

    #[test]
    fn header_round_trip() {
        let header =
            VwHeader { version: VERSION, source: 0x0001, destination: 0x0010, length: 42 };
        assert_eq!(VwHeader::parse(&header.to_bytes()).unwrap(), header);
    }
}
