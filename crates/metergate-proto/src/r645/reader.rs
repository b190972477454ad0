//! Stateful R645 stream reader.
//!
//! Meters share serial-to-TCP converters that happily interleave line noise
//! with frames, so the reader hunts for start delimiters, validates
//! candidates, and resynchronizes by advancing a single byte past a corrupt
//! start rather than dropping the whole buffer.

use bytes::{Buf, BytesMut};

use super::{Frame, MIN_FRAME_LEN, START};
use crate::error::FrameError;

/// Number of discarded bytes included in diagnostic previews.
const PREVIEW_LEN: usize = 32;

/// Events emitted by [`FrameReader::push`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    /// A complete, checksum-valid frame.
    Frame(Frame),
    /// Bytes were discarded during resynchronization.
    Discard {
        /// Hex preview of (up to) the first 32 discarded bytes.
        preview: String,
        /// Why the bytes were dropped.
        reason: String,
    },
}

/// Accumulating frame reader for one connection.
///
/// `push` appends a chunk and drains every complete frame; partial frames
/// stay buffered until more bytes arrive. The emitted sequence is
/// independent of how the stream is chunked.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Bytes currently buffered (incomplete frame prefix).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered state (new connection, protocol rebind).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append a chunk and emit every frame that completes.
    pub fn push(&mut self, data: &[u8]) -> Vec<ReaderEvent> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            // Hunt for the next start delimiter, reporting skipped noise.
            match self.buf.iter().position(|&b| b == START) {
                Some(0) => {},
                Some(n) => {
                    events.push(discard_event(&self.buf[..n], "garbage before frame start"));
                    self.buf.advance(n);
                },
                None => {
                    if !self.buf.is_empty() {
                        events.push(discard_event(&self.buf, "no frame start in buffer"));
                        self.buf.clear();
                    }
                    break;
                },
            }

            if self.buf.len() < MIN_FRAME_LEN {
                break;
            }

            match Frame::decode(&self.buf) {
                Ok((frame, consumed)) => {
                    self.buf.advance(consumed);
                    events.push(ReaderEvent::Frame(frame));
                },
                Err(FrameError::TooShort { .. }) => break,
                Err(err) => {
                    // Corrupt candidate: advance one byte past the start
                    // delimiter and resynchronize.
                    tracing::debug!(error = %err, "frame candidate rejected");
                    events.push(discard_event(&self.buf[..1], &err.to_string()));
                    self.buf.advance(1);
                },
            }
        }

        events
    }
}

fn discard_event(bytes: &[u8], reason: &str) -> ReaderEvent {
    let preview = bytes
        .iter()
        .take(PREVIEW_LEN)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    ReaderEvent::Discard { preview, reason: reason.to_string() }
}
