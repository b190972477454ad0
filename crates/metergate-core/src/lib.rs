//! Sans-IO gateway state for metergate.
//!
//! Everything here is pure state driven by the runtime crate: the
//! per-connection machine ([`connection`]), the registry that owns it
//! ([`registry`]), command decoding and the response envelope
//! ([`command`]), egress mapping to the bus schema ([`telemetry`]) and
//! poll-plan resolution ([`poll`]). Time is passed in as parameters, so the
//! whole crate runs identically under real or virtual clocks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod connection;
pub mod error;
pub mod poll;
pub mod registry;
pub mod telemetry;

pub use command::{CommandKind, CommandRequest, CommandResponse, RegisterTarget, RelayState};
pub use connection::{ConnectionId, ConnectionState, InboundEvent, MeterConnection};
pub use error::{CommandError, RegistryError};
pub use registry::{
    ClosedConnection, ConnectionRegistry, IdentifyOutcome, RegistryConfig, SweepAction,
};
