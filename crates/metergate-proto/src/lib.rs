//! Wire codecs for the metergate gateway.
//!
//! Two unrelated meter protocols share the gateway's listen port:
//!
//! - **R645**: a BCD-encoded register protocol with reversed addresses, an
//!   additive 0x33 payload offset and a mod-256 checksum ([`r645`],
//!   [`codec`], [`registers`]).
//! - **VW**: an 8-byte wrapper carrying DLMS/COSEM APDUs, sometimes written
//!   bare, plus a 26-byte vendor heartbeat ([`vw`], [`apdu`], [`obis`],
//!   [`heartbeat`]).
//!
//! Everything in this crate is pure and synchronous: parsers take byte
//! slices and return typed records plus consumed counts. Stream state is
//! limited to the per-connection accumulation buffers in
//! [`r645::FrameReader`] and [`vw::StreamParser`]. Connection lifecycle,
//! correlation and I/O live in `metergate-core` and `metergate-server`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod apdu;
pub mod codec;
pub mod error;
pub mod heartbeat;
pub mod obis;
pub mod r645;
pub mod registers;
pub mod router;
pub mod vw;

pub use error::{ApduError, CodecError, FrameError};
pub use router::{classify, Classification, ProtocolKind};
