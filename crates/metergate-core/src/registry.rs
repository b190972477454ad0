//! Connection registry: socket lifecycle and meter identity binding.
//!
//! The registry owns every [`MeterConnection`] and the meter-to-connection
//! index. External components hold [`ConnectionId`]s and mutate only
//! through registry methods.
//!
//! # Invariants
//!
//! - `meter_index` is always a subset of `connections`: every indexed id
//!   refers to a live connection.
//! - At most one connection per meter identity. A second connection
//!   identifying with the same id supersedes the first, which moves to
//!   Disconnecting; the caller fails its pending commands and closes the
//!   socket.

use std::{collections::HashMap, net::SocketAddr, ops::Sub, time::Duration};

use metergate_proto::ProtocolKind;

use crate::{
    connection::{ConnectionId, InboundEvent, MeterConnection, TrafficStats},
    error::RegistryError,
};

/// Registry timing and capacity configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum concurrent connections; excess accepts are refused.
    pub max_connections: usize,
    /// Expected heartbeat cadence; idle threshold is twice this.
    pub heartbeat_interval: Duration,
    /// Inactivity ceiling after which a connection is force-closed.
    pub connection_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(300),
        }
    }
}

/// Outcome of binding a meter identity to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyOutcome {
    /// First binding for this meter.
    Identified,
    /// The connection already held this identity.
    AlreadyBound,
    /// A previous connection held the identity and is now Disconnecting;
    /// the caller must fail its pending commands and close its socket.
    Replaced {
        /// Superseded connection.
        previous: ConnectionId,
    },
}

/// Sweeper decisions for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    /// Connection crossed the idle threshold.
    WentIdle(ConnectionId),
    /// Connection exceeded the inactivity ceiling; close it.
    ForceClose(ConnectionId),
}

/// Record returned when a connection is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConnection {
    /// Identity the connection held, if any.
    pub meter_id: Option<String>,
    /// Whether that identity pointed at this connection when it closed
    /// (false when a newer connection already took it over).
    pub was_current_binding: bool,
    /// Final traffic counters.
    pub stats: TrafficStats,
    /// Peer address.
    pub remote: SocketAddr,
}

/// Owner of all connections and the meter index.
#[derive(Debug)]
pub struct ConnectionRegistry<I> {
    connections: HashMap<ConnectionId, MeterConnection<I>>,
    meter_index: HashMap<String, ConnectionId>,
    config: RegistryConfig,
    next_seq: u64,
}

impl<I> ConnectionRegistry<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self { connections: HashMap::new(), meter_index: HashMap::new(), config, next_seq: 0 }
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Accept a socket: mints an id and seeds a Connected-state record.
    pub fn register(&mut self, remote: SocketAddr, now: I) -> Result<ConnectionId, RegistryError> {
        if self.connections.len() >= self.config.max_connections {
            return Err(RegistryError::MaxConnections { limit: self.config.max_connections });
        }
        self.next_seq += 1;
        let id = ConnectionId(format!("conn-{:08x}", self.next_seq));
        self.connections.insert(id.clone(), MeterConnection::new(id.clone(), remote, now));
        tracing::debug!(connection = %id, %remote, "connection registered");
        Ok(id)
    }

    /// Feed inbound bytes through the connection's parser.
    pub fn ingest(
        &mut self,
        id: &ConnectionId,
        data: &[u8],
        now: I,
    ) -> Result<Vec<InboundEvent>, RegistryError> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;
        Ok(conn.ingest(data, now))
    }

    /// Bind `meter_id` to a connection, superseding any previous holder.
    pub fn identify(
        &mut self,
        id: &ConnectionId,
        meter_id: &str,
    ) -> Result<IdentifyOutcome, RegistryError> {
        if !self.connections.contains_key(id) {
            return Err(RegistryError::UnknownConnection(id.clone()));
        }

        let previous = match self.meter_index.get(meter_id) {
            Some(existing) if existing == id => return Ok(IdentifyOutcome::AlreadyBound),
            Some(existing) => Some(existing.clone()),
            None => None,
        };

        if let Some(previous_id) = &previous {
            if let Some(old) = self.connections.get_mut(previous_id) {
                old.begin_disconnect();
            }
            tracing::info!(
                meter = meter_id,
                old = %previous_id,
                new = %id,
                "duplicate connection replaced"
            );
        }

        self.meter_index.insert(meter_id.to_string(), id.clone());
        if let Some(conn) = self.connections.get_mut(id) {
            conn.identify(meter_id.to_string());
        }

        Ok(match previous {
            Some(previous) => IdentifyOutcome::Replaced { previous },
            None => IdentifyOutcome::Identified,
        })
    }

    /// Record a successful outbound write on a connection.
    pub fn record_sent(&mut self, id: &ConnectionId, bytes: usize) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.record_sent(bytes);
        }
    }

    /// Shared view of one connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<&MeterConnection<I>> {
        self.connections.get(id)
    }

    /// Connection currently bound to `meter_id`.
    pub fn connection_for_meter(&self, meter_id: &str) -> Option<&MeterConnection<I>> {
        self.meter_index.get(meter_id).and_then(|id| self.connections.get(id))
    }

    /// Connection id currently bound to `meter_id`.
    pub fn id_for_meter(&self, meter_id: &str) -> Option<&ConnectionId> {
        self.meter_index.get(meter_id)
    }

    /// Remove a connection. The meter mapping is removed iff it still
    /// pointed at this connection.
    pub fn close(&mut self, id: &ConnectionId, reason: &str) -> Option<ClosedConnection> {
        let mut conn = self.connections.remove(id)?;
        conn.mark_disconnected();

        let meter_id = conn.meter_id().map(str::to_string);
        let was_current_binding = match &meter_id {
            Some(meter) => match self.meter_index.get(meter) {
                Some(current) if current == id => {
                    self.meter_index.remove(meter);
                    true
                },
                _ => false,
            },
            None => false,
        };

        tracing::info!(connection = %id, reason, "connection closed");
        Some(ClosedConnection {
            meter_id,
            was_current_binding,
            stats: conn.stats(),
            remote: conn.remote(),
        })
    }

    /// Periodic sweep: flip stale connections to Idle, flag dead ones for
    /// closing. Runs every heartbeat interval.
    pub fn sweep(&mut self, now: I) -> Vec<SweepAction> {
        let idle_threshold = self.config.heartbeat_interval * 2;
        let mut actions = Vec::new();

        for (id, conn) in &mut self.connections {
            if conn.idle_for(now) >= self.config.connection_timeout {
                actions.push(SweepAction::ForceClose(id.clone()));
            } else if conn.mark_idle_if_stale(now, idle_threshold) {
                actions.push(SweepAction::WentIdle(id.clone()));
            }
        }

        actions
    }

    /// Every identified meter with its connection id and protocol binding.
    pub fn identified_meters(&self) -> Vec<(String, ConnectionId, Option<ProtocolKind>)> {
        let mut out: Vec<_> = self
            .meter_index
            .iter()
            .filter_map(|(meter, id)| {
                self.connections
                    .get(id)
                    .map(|conn| (meter.clone(), id.clone(), conn.protocol()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Ids of all live connections.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    /// Iterate all live connections.
    pub fn connections(&self) -> impl Iterator<Item = &MeterConnection<I>> {
        self.connections.values()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Check the meter-index subset invariant. Test/debug aid.
    pub fn index_is_consistent(&self) -> bool {
        self.meter_index.values().all(|id| self.connections.contains_key(id))
    }
}
