//! Per-connection state machine.
//!
//! Owns the inbound byte buffer, the sticky protocol binding and the
//! activity/traffic bookkeeping for one meter socket. Pure state: bytes go
//! in via [`MeterConnection::ingest`], typed events come out, and the
//! caller does all I/O. Time is passed in, so the machine runs under real
//! or virtual clocks.
//!
//! # State machine
//!
//! ```text
//! Connected ──identify──> Identified ──bytes──> Active ⇄ Idle
//!     │                        │                  │        │
//!     └────────────────────────┴──── close ───────┴────────┘
//!                              ↓
//!                        Disconnecting ──socket closed──> Disconnected
//! ```

use std::{net::SocketAddr, ops::Sub, time::Duration};

use bytes::BytesMut;
use metergate_proto::{
    apdu::Apdu,
    classify, heartbeat,
    r645::{self, FrameReader, ReaderEvent},
    router::Classification,
    vw::{StreamEvent, StreamParser},
    ProtocolKind,
};

/// Opaque connection identifier minted by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, no identifying frame yet.
    Connected,
    /// Meter identity bound, no traffic since.
    Identified,
    /// Traffic flowing.
    Active,
    /// No activity for twice the heartbeat interval.
    Idle,
    /// Graceful close in progress.
    Disconnecting,
    /// Socket closed.
    Disconnected,
}

/// Sticky per-connection protocol binding.
#[derive(Debug)]
pub enum ProtocolBinding {
    /// Not yet classified; bytes accumulate until the prefix decides.
    Unbound {
        /// Buffered prefix.
        pending: BytesMut,
    },
    /// Bound to the R645 framer.
    R645(FrameReader),
    /// Bound to the VW stream parser.
    Vw(StreamParser),
}

impl ProtocolBinding {
    /// The bound protocol, if classification has happened.
    pub fn kind(&self) -> Option<ProtocolKind> {
        match self {
            ProtocolBinding::Unbound { .. } => None,
            ProtocolBinding::R645(_) => Some(ProtocolKind::R645),
            ProtocolBinding::Vw(_) => Some(ProtocolKind::Vw),
        }
    }
}

/// Typed events produced from inbound bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A decoded R645 response frame.
    R645(r645::Response),
    /// A decoded APDU (wrapped or raw).
    Apdu {
        /// The decoded PDU.
        apdu: Apdu,
        /// Whether it arrived without a VW wrapper.
        raw: bool,
    },
    /// A vendor heartbeat registration packet.
    Heartbeat(heartbeat::Heartbeat),
    /// Bytes were dropped or failed to decode; never fatal.
    Diagnostic {
        /// Hex preview of the offending bytes.
        preview: String,
        /// What went wrong.
        reason: String,
    },
}

/// Traffic counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Frames/packets decoded from the meter.
    pub frames_received: u64,
    /// Frames/packets written to the meter.
    pub frames_sent: u64,
    /// Bytes read from the socket.
    pub bytes_received: u64,
    /// Bytes written to the socket.
    pub bytes_sent: u64,
}

/// State for one accepted meter socket.
#[derive(Debug)]
pub struct MeterConnection<I> {
    id: ConnectionId,
    remote: SocketAddr,
    state: ConnectionState,
    meter_id: Option<String>,
    binding: ProtocolBinding,
    stats: TrafficStats,
    connected_at: I,
    last_activity: I,
    unclassified_reported: bool,
}

impl<I> MeterConnection<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a connection in [`ConnectionState::Connected`].
    pub fn new(id: ConnectionId, remote: SocketAddr, now: I) -> Self {
        Self {
            id,
            remote,
            state: ConnectionState::Connected,
            meter_id: None,
            binding: ProtocolBinding::Unbound { pending: BytesMut::new() },
            stats: TrafficStats::default(),
            connected_at: now,
            last_activity: now,
            unclassified_reported: false,
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Peer socket address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Bound meter identity, once identified.
    pub fn meter_id(&self) -> Option<&str> {
        self.meter_id.as_deref()
    }

    /// Bound protocol, once classified.
    pub fn protocol(&self) -> Option<ProtocolKind> {
        self.binding.kind()
    }

    /// Traffic counters.
    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    /// When the socket was accepted.
    pub fn connected_at(&self) -> I {
        self.connected_at
    }

    /// Time since the last inbound byte.
    pub fn idle_for(&self, now: I) -> Duration {
        now - self.last_activity
    }

    /// Bind the meter identity. Promotes Connected to Identified; an
    /// already-active connection keeps its state.
    pub fn identify(&mut self, meter_id: String) {
        self.meter_id = Some(meter_id);
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Identified;
        }
    }

    /// Begin a graceful close.
    pub fn begin_disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnecting;
        }
    }

    /// Mark the socket as gone.
    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Record an outbound write.
    pub fn record_sent(&mut self, bytes: usize) {
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += bytes as u64;
    }

    /// Flip Active to Idle when past the threshold. Returns whether the
    /// state changed.
    pub fn mark_idle_if_stale(&mut self, now: I, threshold: Duration) -> bool {
        if matches!(self.state, ConnectionState::Active | ConnectionState::Identified)
            && self.idle_for(now) >= threshold
        {
            self.state = ConnectionState::Idle;
            return true;
        }
        false
    }

    /// Feed inbound bytes and drain every event that completes.
    ///
    /// Updates activity and traffic accounting, performs first-bytes
    /// protocol classification, and routes the chunk to the bound parser.
    /// Parser-level failures surface as [`InboundEvent::Diagnostic`] and
    /// never abort the connection.
    pub fn ingest(&mut self, data: &[u8], now: I) -> Vec<InboundEvent> {
        self.last_activity = now;
        self.stats.bytes_received += data.len() as u64;
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Identified) {
            self.state = ConnectionState::Active;
        }

        // Resolve the binding first so the borrow of `pending` ends before
        // the parsers run.
        if let ProtocolBinding::Unbound { pending } = &mut self.binding {
            pending.extend_from_slice(data);
            match classify(pending) {
                Classification::Bound(ProtocolKind::R645) => {
                    let buffered = pending.split().freeze();
                    self.binding = ProtocolBinding::R645(FrameReader::new());
                    return self.drive_parsers(&buffered);
                },
                Classification::Bound(ProtocolKind::Vw) => {
                    let buffered = pending.split().freeze();
                    self.binding = ProtocolBinding::Vw(StreamParser::new());
                    return self.drive_parsers(&buffered);
                },
                Classification::NeedMoreData => return Vec::new(),
                Classification::Unknown => {
                    if self.unclassified_reported {
                        return Vec::new();
                    }
                    self.unclassified_reported = true;
                    let preview = pending
                        .iter()
                        .take(16)
                        .map(|b| format!("{b:02x}"))
                        .collect::<Vec<_>>()
                        .join(" ");
                    return vec![InboundEvent::Diagnostic {
                        preview,
                        reason: "unclassified protocol prefix".to_string(),
                    }];
                },
            }
        }

        self.drive_parsers(data)
    }

    fn drive_parsers(&mut self, data: &[u8]) -> Vec<InboundEvent> {
        match &mut self.binding {
            ProtocolBinding::Unbound { .. } => Vec::new(),
            ProtocolBinding::R645(reader) => {
                let mut events = Vec::new();
                for event in reader.push(data) {
                    match event {
                        ReaderEvent::Frame(frame) => {
                            self.stats.frames_received += 1;
                            match r645::Response::from_frame(&frame) {
                                Ok(response) => events.push(InboundEvent::R645(response)),
                                Err(err) => events.push(InboundEvent::Diagnostic {
                                    preview: frame
                                        .payload
                                        .iter()
                                        .take(16)
                                        .map(|b| format!("{b:02x}"))
                                        .collect::<Vec<_>>()
                                        .join(" "),
                                    reason: err.to_string(),
                                }),
                            }
                        },
                        ReaderEvent::Discard { preview, reason } => {
                            events.push(InboundEvent::Diagnostic { preview, reason });
                        },
                    }
                }
                events
            },
            ProtocolBinding::Vw(parser) => {
                let mut events = Vec::new();
                for event in parser.push(data) {
                    match event {
                        StreamEvent::Packet(packet) => {
                            self.stats.frames_received += 1;
                            if heartbeat::looks_like_heartbeat(&packet.payload) {
                                match heartbeat::parse(&packet.payload) {
                                    Ok(hb) => events.push(InboundEvent::Heartbeat(hb)),
                                    Err(err) => events.push(InboundEvent::Diagnostic {
                                        preview: hex_preview(&packet.payload),
                                        reason: err.to_string(),
                                    }),
                                }
                                continue;
                            }
                            match Apdu::decode(&packet.payload) {
                                Ok((apdu, _)) => {
                                    events.push(InboundEvent::Apdu { apdu, raw: packet.is_raw });
                                },
                                Err(err) => events.push(InboundEvent::Diagnostic {
                                    preview: hex_preview(&packet.payload),
                                    reason: err.to_string(),
                                }),
                            }
                        },
                        StreamEvent::Discard { preview, reason } => {
                            events.push(InboundEvent::Diagnostic { preview, reason });
                        },
                    }
                }
                events
            },
        }
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes.iter().take(16).map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}
