//! Request/response correlation for both protocols.
//!
//! Two parallel correlation tables:
//!
//! - **R645** pending entries are keyed by `(meter, expected response)`:
//!   the data identifier for reads, the operation kind otherwise. A second
//!   send for the same key collapses into the existing pending entry.
//! - **DLMS** pending entries live in a per-meter inner map keyed by APDU
//!   kind (one-shot command sequences) or invoke id (batched poll GETs).
//!   A sweeper drops entries older than 30 s but never unlinks an inner
//!   map from its meter: the poll loop may still be inserting through it,
//!   and unlinking would make later resolutions miss.
//!
//! Every DLMS sequence runs under the per-meter association lock, acquired
//! with a timeout, so at most one AARQ–operation–RLRQ bracket is in flight
//! per meter.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use metergate_core::error::CommandError;
use metergate_proto::{
    apdu::{self, Apdu, DataValue, GetResult},
    obis::ObisCode,
    r645, vw, ProtocolKind,
};
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};

use crate::lock_poisonless;

/// Age past which unresolved DLMS pending entries are reaped.
pub const STALE_PENDING_AGE: Duration = Duration::from_secs(30);

/// Write access to meter sockets, implemented by the gateway runtime.
#[async_trait]
pub trait MeterWire: Send + Sync {
    /// Write bytes to the meter's socket. Returns whether a connection
    /// existed and accepted the write.
    async fn send(&self, meter_id: &str, bytes: Vec<u8>) -> bool;

    /// Protocol the meter's connection is bound to, if connected.
    fn protocol(&self, meter_id: &str) -> Option<ProtocolKind>;
}

/// Dispatcher timeouts, sourced from config.
#[derive(Debug, Clone)]
pub struct DispatcherTiming {
    /// R645 command timeout.
    pub command_timeout: Duration,
    /// AARE wait.
    pub association_timeout: Duration,
    /// Per-GET wait.
    pub query_timeout: Duration,
    /// Association lock acquisition for read sequences.
    pub lock_timeout: Duration,
    /// Association lock acquisition for relay sequences.
    pub relay_lock_timeout: Duration,
    /// Delay between relay ACTION and the confirmation GET.
    pub relay_confirm_delay: Duration,
}

impl Default for DispatcherTiming {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            association_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(30),
            relay_lock_timeout: Duration::from_secs(15),
            relay_confirm_delay: Duration::from_secs(1),
        }
    }
}

/// Outbound APDU framing options.
#[derive(Debug, Clone, Copy)]
pub struct DlmsWireOptions {
    /// Whether outbound APDUs get the VW wrapper.
    pub wrap: bool,
    /// Destination wPort when wrapping.
    pub destination: u16,
}

impl Default for DlmsWireOptions {
    fn default() -> Self {
        Self { wrap: true, destination: vw::DLMS_DESTINATION }
    }
}

/// R645 correlation key: what response completes the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum R645Key {
    /// Read response carrying this data identifier.
    Di(u32),
    /// Write acknowledgement.
    Write,
    /// Relay acknowledgement.
    Relay,
    /// Address-discovery response.
    Address,
}

/// DLMS correlation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DlmsKey {
    /// Association response.
    Aare,
    /// GET response awaited by a command sequence.
    Get,
    /// ACTION response awaited by a command sequence.
    Action,
    /// Release response.
    Release,
    /// Poll GET matched by invoke id.
    Invoke(u8),
}

type R645Waiter = oneshot::Sender<Result<r645::Response, CommandError>>;
type DlmsWaiter = oneshot::Sender<Result<Apdu, CommandError>>;

struct DlmsPending {
    waiter: Option<DlmsWaiter>,
    poll_obis: Option<ObisCode>,
    issued_at: Instant,
}

/// How an inbound APDU was consumed.
#[derive(Debug, PartialEq, Eq)]
pub enum ApduMatch {
    /// Delivered to a waiting command sequence.
    Waiter,
    /// Matched a poll GET; the caller maps the value to telemetry.
    Poll {
        /// OBIS code the poll GET targeted.
        obis: ObisCode,
    },
    /// Nothing was waiting for it.
    Unmatched,
}

/// The correlation engine.
pub struct Dispatcher {
    r645: Mutex<HashMap<String, HashMap<R645Key, Vec<R645Waiter>>>>,
    dlms: Mutex<HashMap<String, HashMap<DlmsKey, DlmsPending>>>,
    locks: Mutex<HashMap<String, std::sync::Arc<AsyncMutex<()>>>>,
    next_invoke: Mutex<HashMap<String, u8>>,
    timing: DispatcherTiming,
    wire_options: DlmsWireOptions,
}

impl Dispatcher {
    /// Create with the given timeouts and framing options.
    pub fn new(timing: DispatcherTiming, wire_options: DlmsWireOptions) -> Self {
        Self {
            r645: Mutex::new(HashMap::new()),
            dlms: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            next_invoke: Mutex::new(HashMap::new()),
            timing,
            wire_options,
        }
    }

    /// Dispatcher timeouts.
    pub fn timing(&self) -> &DispatcherTiming {
        &self.timing
    }

    // ---- R645 ----

    /// Send an R645 frame and await the response selected by `key`.
    ///
    /// When the key already has a pending entry the new caller collapses
    /// into it and no second frame is written.
    pub async fn send_r645(
        &self,
        wire: &dyn MeterWire,
        meter_id: &str,
        frame: &r645::Frame,
        key: R645Key,
        timeout: Duration,
    ) -> Result<r645::Response, CommandError> {
        match wire.protocol(meter_id) {
            Some(ProtocolKind::R645) => {},
            Some(ProtocolKind::Vw) => {
                return Err(CommandError::ProtocolMismatch { required: ProtocolKind::R645 });
            },
            None => return Err(CommandError::MeterNotConnected(meter_id.to_string())),
        }

        let bytes = frame
            .encode()
            .map_err(|e| CommandError::Invalid(format!("cannot encode frame: {e}")))?;

        let (tx, rx) = oneshot::channel();
        let first_waiter = {
            let mut map = lock_poisonless(&self.r645);
            let waiters = map.entry(meter_id.to_string()).or_default().entry(key).or_default();
            waiters.push(tx);
            waiters.len() == 1
        };

        if first_waiter && !wire.send(meter_id, bytes).await {
            self.remove_r645(meter_id, key);
            return Err(CommandError::MeterNotConnected(meter_id.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommandError::ConnectionClosed),
            Err(_) => {
                self.remove_r645(meter_id, key);
                Err(CommandError::CommandTimeout)
            },
        }
    }

    fn remove_r645(&self, meter_id: &str, key: R645Key) {
        let mut map = lock_poisonless(&self.r645);
        if let Some(inner) = map.get_mut(meter_id) {
            inner.remove(&key);
            if inner.is_empty() {
                map.remove(meter_id);
            }
        }
    }

    /// Resolve pending R645 commands from a decoded response. Returns
    /// whether anything was waiting.
    pub fn resolve_r645(&self, meter_id: &str, response: &r645::Response) -> bool {
        let waiters = {
            let mut map = lock_poisonless(&self.r645);
            match response {
                // An error response carries no data identifier; it rejects
                // everything pending on this meter.
                r645::Response::Error { mask, .. } => {
                    let Some(inner) = map.remove(meter_id) else {
                        return false;
                    };
                    let error = CommandError::MeterError {
                        code: mask.0,
                        message: mask.message(),
                    };
                    for (_, waiters) in inner {
                        for waiter in waiters {
                            let _ = waiter.send(Err(error.clone()));
                        }
                    }
                    return true;
                },
                r645::Response::Read { value, .. } => {
                    take_r645_waiters(&mut map, meter_id, R645Key::Di(value.di))
                },
                r645::Response::WriteAck { .. } => {
                    take_r645_waiters(&mut map, meter_id, R645Key::Write)
                },
                r645::Response::RelayAck { .. } => {
                    take_r645_waiters(&mut map, meter_id, R645Key::Relay)
                },
                r645::Response::Address { .. } => {
                    take_r645_waiters(&mut map, meter_id, R645Key::Address)
                },
            }
        };

        let Some(waiters) = waiters else {
            return false;
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(response.clone()));
        }
        true
    }

    // ---- DLMS ----

    /// Allocate the next invoke id for a meter, cycling 1..=255.
    pub fn alloc_invoke(&self, meter_id: &str) -> u8 {
        let mut map = lock_poisonless(&self.next_invoke);
        let slot = map.entry(meter_id.to_string()).or_insert(0);
        *slot = if *slot >= 255 { 1 } else { *slot + 1 };
        *slot
    }

    /// Acquire the association lock and open an association.
    ///
    /// On success the returned guard holds the per-meter lock; dropping it
    /// releases the lock on every exit path.
    pub async fn associate(
        &self,
        wire: &dyn MeterWire,
        meter_id: &str,
        lock_timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, CommandError> {
        if wire.protocol(meter_id) != Some(ProtocolKind::Vw) {
            return Err(match wire.protocol(meter_id) {
                Some(_) => CommandError::ProtocolMismatch { required: ProtocolKind::Vw },
                None => CommandError::MeterNotConnected(meter_id.to_string()),
            });
        }

        let lock = {
            let mut locks = lock_poisonless(&self.locks);
            locks
                .entry(meter_id.to_string())
                .or_insert_with(|| std::sync::Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = tokio::time::timeout(lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| CommandError::AssociationBusy)?;

        let rx = self.register_dlms(meter_id, DlmsKey::Aare);
        let aarq = vw::prepare(
            apdu::encode_aarq(),
            self.wire_options.wrap,
            self.wire_options.destination,
        );
        if !wire.send(meter_id, aarq).await {
            self.remove_dlms(meter_id, DlmsKey::Aare);
            return Err(CommandError::MeterNotConnected(meter_id.to_string()));
        }

        let apdu = match tokio::time::timeout(self.timing.association_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(CommandError::ConnectionClosed),
            Err(_) => {
                self.remove_dlms(meter_id, DlmsKey::Aare);
                return Err(CommandError::AssociationTimeout);
            },
        };

        match apdu {
            Apdu::Aare { accepted: true, .. } => Ok(guard),
            Apdu::Aare { accepted: false, result } => {
                Err(CommandError::AssociationRejected(result))
            },
            other => Err(CommandError::Invalid(format!(
                "unexpected association reply {:#04x}",
                other.tag()
            ))),
        }
    }

    /// One GET inside an open association, matched by APDU kind.
    pub async fn get(
        &self,
        wire: &dyn MeterWire,
        meter_id: &str,
        class_id: u16,
        obis: ObisCode,
        attribute: u8,
    ) -> Result<DataValue, CommandError> {
        let invoke = self.alloc_invoke(meter_id);
        let rx = self.register_dlms(meter_id, DlmsKey::Get);
        let request = vw::prepare(
            apdu::encode_get_request(invoke, class_id, obis, attribute),
            self.wire_options.wrap,
            self.wire_options.destination,
        );
        if !wire.send(meter_id, request).await {
            self.remove_dlms(meter_id, DlmsKey::Get);
            return Err(CommandError::MeterNotConnected(meter_id.to_string()));
        }

        let apdu = match tokio::time::timeout(self.timing.query_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(CommandError::ConnectionClosed),
            Err(_) => {
                self.remove_dlms(meter_id, DlmsKey::Get);
                return Err(CommandError::OperationTimeout);
            },
        };

        match apdu {
            Apdu::GetResponse { result: GetResult::Data(value), .. } => Ok(value),
            Apdu::GetResponse { result: GetResult::Error(code), .. } => {
                Err(CommandError::AccessDenied(code))
            },
            other => Err(CommandError::Invalid(format!(
                "unexpected GET reply {:#04x}",
                other.tag()
            ))),
        }
    }

    /// One ACTION inside an open association, matched by APDU kind.
    pub async fn action(
        &self,
        wire: &dyn MeterWire,
        meter_id: &str,
        class_id: u16,
        obis: ObisCode,
        method: u8,
    ) -> Result<Option<DataValue>, CommandError> {
        let invoke = self.alloc_invoke(meter_id);
        let rx = self.register_dlms(meter_id, DlmsKey::Action);
        let request = vw::prepare(
            apdu::encode_action_request(invoke, class_id, obis, method),
            self.wire_options.wrap,
            self.wire_options.destination,
        );
        if !wire.send(meter_id, request).await {
            self.remove_dlms(meter_id, DlmsKey::Action);
            return Err(CommandError::MeterNotConnected(meter_id.to_string()));
        }

        let apdu = match tokio::time::timeout(self.timing.query_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(CommandError::ConnectionClosed),
            Err(_) => {
                self.remove_dlms(meter_id, DlmsKey::Action);
                return Err(CommandError::OperationTimeout);
            },
        };

        match apdu {
            Apdu::ActionResponse { result: 0, data, .. } => Ok(data),
            Apdu::ActionResponse { result, .. } => Err(CommandError::ActionFailed(result)),
            other => Err(CommandError::Invalid(format!(
                "unexpected ACTION reply {:#04x}",
                other.tag()
            ))),
        }
    }

    /// Fire-and-forget release request.
    pub async fn release(&self, wire: &dyn MeterWire, meter_id: &str) {
        let rlrq = vw::prepare(
            apdu::encode_rlrq(),
            self.wire_options.wrap,
            self.wire_options.destination,
        );
        if !wire.send(meter_id, rlrq).await {
            tracing::debug!(meter = meter_id, "release request not sent, connection gone");
        }
    }

    /// Send one batched poll GET: allocates an invoke id, records the
    /// pending entry, writes the request. The response arrives through the
    /// normal inbound pipeline and is matched by invoke id.
    pub async fn poll_get(
        &self,
        wire: &dyn MeterWire,
        meter_id: &str,
        class_id: u16,
        obis: ObisCode,
        attribute: u8,
        now: Instant,
    ) -> bool {
        let invoke = self.alloc_invoke(meter_id);
        self.register_poll_get(meter_id, invoke, obis, now);
        let request = vw::prepare(
            apdu::encode_get_request(invoke, class_id, obis, attribute),
            self.wire_options.wrap,
            self.wire_options.destination,
        );
        wire.send(meter_id, request).await
    }

    /// Record a poll GET so its asynchronous response can be attributed.
    pub fn register_poll_get(&self, meter_id: &str, invoke: u8, obis: ObisCode, now: Instant) {
        let mut map = lock_poisonless(&self.dlms);
        map.entry(meter_id.to_string()).or_default().insert(
            DlmsKey::Invoke(invoke),
            DlmsPending { waiter: None, poll_obis: Some(obis), issued_at: now },
        );
    }

    /// Route an inbound APDU to whatever is waiting for it.
    ///
    /// Responses match by invoke id first (poll GETs), then by APDU kind
    /// (one-shot command sequences).
    pub fn resolve_apdu(&self, meter_id: &str, apdu: &Apdu) -> ApduMatch {
        let key_candidates: Vec<DlmsKey> = match apdu {
            Apdu::Aare { .. } => vec![DlmsKey::Aare],
            Apdu::GetResponse { invoke_id, .. } => {
                vec![DlmsKey::Invoke(*invoke_id), DlmsKey::Get]
            },
            Apdu::ActionResponse { invoke_id, .. } => {
                vec![DlmsKey::Invoke(*invoke_id), DlmsKey::Action]
            },
            Apdu::SetResponse { invoke_id, .. } => vec![DlmsKey::Invoke(*invoke_id)],
            Apdu::Rlre => vec![DlmsKey::Release],
            _ => return ApduMatch::Unmatched,
        };

        let pending = {
            let mut map = lock_poisonless(&self.dlms);
            let Some(inner) = map.get_mut(meter_id) else {
                return ApduMatch::Unmatched;
            };
            // The inner map stays linked even when this removal empties it:
            // an in-flight poll batch may still insert through it.
            key_candidates.iter().find_map(|key| inner.remove(key))
        };

        match pending {
            Some(DlmsPending { waiter: Some(waiter), .. }) => {
                let _ = waiter.send(Ok(apdu.clone()));
                ApduMatch::Waiter
            },
            Some(DlmsPending { poll_obis: Some(obis), .. }) => ApduMatch::Poll { obis },
            Some(DlmsPending { .. }) | None => ApduMatch::Unmatched,
        }
    }

    /// Fail every pending command for a meter (connection closed or
    /// superseded).
    pub fn fail_meter(&self, meter_id: &str, error: &CommandError) {
        let r645_waiters = lock_poisonless(&self.r645).remove(meter_id);
        if let Some(inner) = r645_waiters {
            for (_, waiters) in inner {
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }

        let dlms_pending = lock_poisonless(&self.dlms).remove(meter_id);
        if let Some(inner) = dlms_pending {
            for (_, pending) in inner {
                if let Some(waiter) = pending.waiter {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }
    }

    /// Reap DLMS pending entries older than [`STALE_PENDING_AGE`].
    ///
    /// Inner maps are left in place even when emptied; see the module
    /// documentation.
    pub fn sweep_stale(&self, now: Instant) -> usize {
        let mut reaped = 0;
        let mut map = lock_poisonless(&self.dlms);
        for inner in map.values_mut() {
            let before = inner.len();
            inner.retain(|_, pending| now.duration_since(pending.issued_at) < STALE_PENDING_AGE);
            reaped += before - inner.len();
        }
        reaped
    }

    /// Number of pending DLMS entries for a meter. Test/metrics aid.
    pub fn pending_dlms_count(&self, meter_id: &str) -> usize {
        lock_poisonless(&self.dlms).get(meter_id).map_or(0, HashMap::len)
    }

    /// Whether a meter still has an inner DLMS map linked. Test aid.
    pub fn has_dlms_slot(&self, meter_id: &str) -> bool {
        lock_poisonless(&self.dlms).contains_key(meter_id)
    }

    fn register_dlms(
        &self,
        meter_id: &str,
        key: DlmsKey,
    ) -> oneshot::Receiver<Result<Apdu, CommandError>> {
        let (tx, rx) = oneshot::channel();
        let mut map = lock_poisonless(&self.dlms);
        map.entry(meter_id.to_string()).or_default().insert(
            key,
            DlmsPending { waiter: Some(tx), poll_obis: None, issued_at: Instant::now() },
        );
        rx
    }

    fn remove_dlms(&self, meter_id: &str, key: DlmsKey) {
        let mut map = lock_poisonless(&self.dlms);
        if let Some(inner) = map.get_mut(meter_id) {
            inner.remove(&key);
        }
    }
}

fn take_r645_waiters(
    map: &mut HashMap<String, HashMap<R645Key, Vec<R645Waiter>>>,
    meter_id: &str,
    key: R645Key,
) -> Option<Vec<R645Waiter>> {
    let inner = map.get_mut(meter_id)?;
    let waiters = inner.remove(&key);
    if inner.is_empty() {
        map.remove(meter_id);
    }
    waiters
}

/// A `MeterWire` that records writes. Test aid.
#[cfg(test)]
pub(crate) struct RecordingWire {
    protocol: Option<ProtocolKind>,
    sent: Mutex<Vec<Vec<u8>>>,
    notify: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
}

#[cfg(test)]
impl RecordingWire {
    pub(crate) fn new(
        protocol: Option<ProtocolKind>,
    ) -> (std::sync::Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self { protocol, sent: Mutex::new(Vec::new()), notify: tx }),
            rx,
        )
    }
}

#[cfg(test)]
#[async_trait]
impl MeterWire for RecordingWire {
    async fn send(&self, _meter_id: &str, bytes: Vec<u8>) -> bool {
        lock_poisonless(&self.sent).push(bytes.clone());
        let _ = self.notify.send(bytes);
        true
    }

    fn protocol(&self, _meter_id: &str) -> Option<ProtocolKind> {
        self.protocol
    }
}
