//! Error types for gateway state and command processing.
//!
//! Parser-level errors never reach these types; they are absorbed as
//! diagnostic events at the connection boundary. What remains is the
//! registry lifecycle surface and the command failure taxonomy reported on
//! the bus.

use metergate_proto::ProtocolKind;
use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors from connection registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The configured connection cap is reached; the accept is refused.
    #[error("connection limit of {limit} reached")]
    MaxConnections {
        /// Configured cap.
        limit: usize,
    },

    /// Operation referenced a connection id that is not registered.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

/// Command failure taxonomy surfaced on the bus response topic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Request validation failed before touching the wire.
    #[error("invalid command: {0}")]
    Invalid(String),

    /// No connection is currently bound to the target meter.
    #[error("meter {0} is not connected")]
    MeterNotConnected(String),

    /// The command requires a protocol the meter is not speaking.
    #[error("command requires the {required:?} protocol")]
    ProtocolMismatch {
        /// Protocol the command needs.
        required: ProtocolKind,
    },

    /// No response arrived before the command timeout.
    #[error("command timed out")]
    CommandTimeout,

    /// The meter returned an R645 error response.
    #[error("meter error: {message}")]
    MeterError {
        /// Raw condition bitmask.
        code: u8,
        /// Decoded bitmask description.
        message: String,
    },

    /// The DLMS association was rejected by the meter.
    #[error("association rejected (result {0})")]
    AssociationRejected(u8),

    /// No AARE arrived within the association timeout.
    #[error("association timed out")]
    AssociationTimeout,

    /// The association lock could not be acquired in time.
    #[error("association busy")]
    AssociationBusy,

    /// A GET/ACTION inside an open association timed out.
    #[error("operation timed out")]
    OperationTimeout,

    /// The server reported a data-access failure.
    #[error("access denied (data-access-result {0})")]
    AccessDenied(u8),

    /// The server reported an action failure.
    #[error("action failed (action-result {0})")]
    ActionFailed(u8),

    /// The connection closed while the command was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// A newer connection for the same meter superseded this one.
    #[error("replaced by newer connection")]
    ReplacedByNewerConnection,

    /// The socket write failed.
    #[error("connection error: {0}")]
    ConnectionError(String),
}

impl CommandError {
    /// Short machine-readable code for the bus error field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid_request",
            Self::MeterNotConnected(_) => "meter_not_connected",
            Self::ProtocolMismatch { .. } => "protocol_mismatch",
            Self::CommandTimeout => "command_timeout",
            Self::MeterError { .. } => "meter_error",
            Self::AssociationRejected(_) => "association_rejected",
            Self::AssociationTimeout => "association_timeout",
            Self::AssociationBusy => "association_busy",
            Self::OperationTimeout => "operation_timeout",
            Self::AccessDenied(_) => "access_denied",
            Self::ActionFailed(_) => "action_failed",
            Self::ConnectionClosed => "connection_closed",
            Self::ReplacedByNewerConnection => "replaced_by_newer_connection",
            Self::ConnectionError(_) => "connection_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = CommandError::MeterNotConnected("000000001234".to_string());
        assert_eq!(err.to_string(), "meter 000000001234 is not connected");
        assert_eq!(err.code(), "meter_not_connected");

        let err = CommandError::MeterError {
            code: 0x04,
            message: "password/authorization failure".to_string(),
        };
        assert!(err.to_string().contains("password"));

        let err = RegistryError::MaxConnections { limit: 10 };
        assert_eq!(err.to_string(), "connection limit of 10 reached");
    }

    #[test]
    fn association_errors_mention_association() {
        assert!(CommandError::AssociationRejected(1).to_string().contains("association"));
        assert!(CommandError::AssociationTimeout.to_string().contains("association"));
        assert!(CommandError::AssociationBusy.to_string().contains("association"));
    }
}
