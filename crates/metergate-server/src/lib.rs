//! Metergate production runtime.
//!
//! Wires the sans-IO state from `metergate-core` and the codecs from
//! `metergate-proto` to real I/O: a plain-TCP meter listener, per-
//! connection reader/writer tasks, the request/response correlation engine
//! with per-meter association locks, the periodic poller and the bus
//! surface.
//!
//! # Components
//!
//! - [`Gateway`]: accept loop and inbound fan-out
//! - [`Dispatcher`]: pending-command correlation for both protocols
//! - [`Bus`] / [`InMemoryBus`]: publish/subscribe contract and the
//!   in-process implementation used by tests and the standalone binary
//! - [`GatewayConfig`]: the full option surface with defaults

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod commands;
mod config;
mod dispatcher;
mod error;
mod gateway;
mod poller;

use std::time::{SystemTime, UNIX_EPOCH};

pub use bus::{topic_matches, Bus, BusMessage, InMemoryBus, Topics};
pub use config::{
    DlmsConfig, GatewayConfig, HeartbeatConfig, PollingConfig, R645Config, ZeroAddressAction,
};
pub use dispatcher::{
    ApduMatch, Dispatcher, DispatcherTiming, DlmsKey, DlmsWireOptions, MeterWire, R645Key,
    STALE_PENDING_AGE,
};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayHandle};

/// Current wall clock as Unix milliseconds.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Lock a std mutex, recovering from poisoning: the shared maps hold plain
/// data and a panicked holder leaves them structurally intact.
pub(crate) fn lock_poisonless<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
