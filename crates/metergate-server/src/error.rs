//! Runtime error types.

use thiserror::Error;

/// Errors that abort gateway startup or a runtime subsystem.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration file missing or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// Listener bind failure; the only process-level fatal besides memory
    /// pressure.
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),

    /// Bus operation failed.
    #[error("bus error: {0}")]
    Bus(String),
}
