//! The production gateway runtime.
//!
//! Wraps the sans-IO state from `metergate-core` with real I/O: a TCP
//! listener for meters, one reader and one writer task per connection, the
//! command subscription, and the periodic sweepers. All registry state
//! lives behind one mutex that is never held across an await; socket
//! writes go through per-connection channels so outbound bytes stay
//! serialized per meter.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use metergate_core::{
    command::{self, CommandResponse},
    connection::{ConnectionId, InboundEvent},
    error::CommandError,
    registry::{ConnectionRegistry, IdentifyOutcome, RegistryConfig, SweepAction},
    telemetry::{self, TelemetryRecord},
};
use metergate_proto::{
    apdu::{Apdu, GetResult},
    codec::{BROADCAST_NINES, BROADCAST_WILDCARD},
    heartbeat::Heartbeat,
    r645::{self, read_address_request},
    ProtocolKind,
};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Notify},
};

use crate::{
    bus::{Bus, Topics},
    commands,
    config::{GatewayConfig, ZeroAddressAction},
    dispatcher::{ApduMatch, Dispatcher, DispatcherTiming, DlmsWireOptions, MeterWire},
    error::GatewayError,
    lock_poisonless, poller, unix_ms,
};

/// The meter gateway: TCP front end, correlation engine, bus egress.
pub struct Gateway {
    inner: Arc<Inner>,
    listener: TcpListener,
    shutdown: watch::Sender<bool>,
}

/// Handle for stopping a running gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    shutdown: watch::Sender<bool>,
}

impl GatewayHandle {
    /// Begin graceful shutdown: close every connection, publish offline
    /// statuses, stop the listener.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Shared runtime state.
pub(crate) struct Inner {
    config: GatewayConfig,
    topics: Topics,
    bus: Arc<dyn Bus>,
    registry: StdMutex<ConnectionRegistry<Instant>>,
    writers: StdMutex<HashMap<ConnectionId, mpsc::Sender<Vec<u8>>>>,
    closers: StdMutex<HashMap<ConnectionId, Arc<Notify>>>,
    dispatcher: Dispatcher,
    ack_payload: Vec<u8>,
    started_at: Instant,
}

impl Gateway {
    /// Bind the meter listener and assemble the runtime.
    pub async fn bind(config: GatewayConfig, bus: Arc<dyn Bus>) -> Result<Self, GatewayError> {
        let ack_payload = config.heartbeat.ack_payload()?;

        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        tracing::info!(port = config.listen_port, "meter listener bound");

        let timing = DispatcherTiming {
            command_timeout: config.command_timeout(),
            association_timeout: Duration::from_millis(config.dlms.association_timeout_ms),
            query_timeout: Duration::from_millis(config.dlms.query_timeout_ms),
            ..DispatcherTiming::default()
        };
        let wire_options = DlmsWireOptions {
            wrap: config.dlms.wrap_outgoing,
            destination: config.dlms.ivy_destination,
        };
        let registry = ConnectionRegistry::new(RegistryConfig {
            max_connections: config.max_connections,
            heartbeat_interval: config.heartbeat_interval(),
            connection_timeout: config.connection_timeout(),
        });

        let topics = Topics::new(config.topic_prefix.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                topics,
                bus,
                registry: StdMutex::new(registry),
                writers: StdMutex::new(HashMap::new()),
                closers: StdMutex::new(HashMap::new()),
                dispatcher: Dispatcher::new(timing, wire_options),
                ack_payload,
                started_at: Instant::now(),
            }),
            listener,
            shutdown,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for shutting the gateway down from elsewhere.
    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle { shutdown: self.shutdown.clone() }
    }

    /// Run until shut down: accept meters, route frames, serve commands.
    pub async fn run(self) -> Result<(), GatewayError> {
        let inner = self.inner;
        let shutdown = self.shutdown;

        inner.publish_gateway_status(true).await;

        tokio::spawn(command_loop(Arc::clone(&inner), shutdown.subscribe()));
        tokio::spawn(sweep_loop(Arc::clone(&inner), shutdown.subscribe()));
        if inner.config.polling.enabled {
            tokio::spawn(poller::run(Arc::clone(&inner), shutdown.subscribe()));
        }

        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tokio::spawn(handle_connection(
                            Arc::clone(&inner),
                            stream,
                            remote,
                            shutdown.subscribe(),
                        ));
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                    },
                },
            }
        }

        inner.shutdown_all().await;
        inner.publish_gateway_status(false).await;
        tracing::info!("gateway stopped");
        Ok(())
    }
}

impl Inner {
    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Protocol the meter's connection is bound to.
    pub(crate) fn protocol_of(&self, meter_id: &str) -> Option<ProtocolKind> {
        lock_poisonless(&self.registry)
            .connection_for_meter(meter_id)
            .and_then(|conn| conn.protocol())
    }

    /// Snapshot of identified meters for the poller.
    pub(crate) fn identified_meters(&self) -> Vec<(String, ConnectionId, Option<ProtocolKind>)> {
        lock_poisonless(&self.registry).identified_meters()
    }

    /// Write to a connection's socket through its outbound channel.
    pub(crate) async fn send_to_connection(&self, id: &ConnectionId, bytes: Vec<u8>) -> bool {
        let sender = lock_poisonless(&self.writers).get(id).cloned();
        let Some(sender) = sender else {
            return false;
        };
        let len = bytes.len();
        if sender.send(bytes).await.is_err() {
            return false;
        }
        lock_poisonless(&self.registry).record_sent(id, len);
        true
    }

    async fn publish_json(&self, topic: &str, payload: &Value, retain: bool) {
        let bytes = payload.to_string().into_bytes();
        self.bus.publish(topic, bytes, retain).await;
    }

    pub(crate) async fn publish_telemetry(&self, record: &TelemetryRecord) {
        let topic = self.topics.telemetry(&record.meter_id);
        self.publish_json(&topic, &record.bus_payload(), false).await;
    }

    pub(crate) async fn publish_batch_telemetry(&self, meter_id: &str, records: &[TelemetryRecord]) {
        let topic = self.topics.telemetry(meter_id);
        let payload = telemetry::batch_payload(meter_id, unix_ms(), records);
        self.publish_json(&topic, &payload, false).await;
    }

    pub(crate) async fn publish_event(&self, meter_id: &str, event: &str, data: Value) {
        let topic = self.topics.events(meter_id);
        let payload = telemetry::event_payload(meter_id, event, data, unix_ms());
        self.publish_json(&topic, &payload, false).await;
    }

    async fn publish_status(&self, meter_id: &str, online: bool, ip: Option<&str>) {
        let topic = self.topics.status(meter_id);
        let payload = if online {
            telemetry::status_payload(meter_id, true, ip, Some(unix_ms()), None)
        } else {
            telemetry::status_payload(meter_id, false, None, None, Some(unix_ms()))
        };
        self.publish_json(&topic, &payload, true).await;
    }

    async fn publish_gateway_status(&self, online: bool) {
        let payload = telemetry::gateway_status_payload(
            online,
            env!("CARGO_PKG_VERSION"),
            self.started_at.elapsed().as_secs(),
        );
        self.publish_json(&self.topics.gateway_status(), &payload, true).await;
    }

    fn trigger_close(&self, id: &ConnectionId) {
        if let Some(closer) = lock_poisonless(&self.closers).get(id).cloned() {
            closer.notify_one();
        }
    }

    async fn shutdown_all(&self) {
        // Readers observe the shutdown watch; nudge any that are blocked.
        let ids = lock_poisonless(&self.registry).connection_ids();
        for id in &ids {
            self.trigger_close(id);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Clean up whatever did not exit in time.
        let remaining = lock_poisonless(&self.registry).connection_ids();
        for id in remaining {
            let closed = lock_poisonless(&self.registry).close(&id, "gateway shutdown");
            if let Some(closed) = closed {
                if let Some(meter_id) = &closed.meter_id {
                    if closed.was_current_binding {
                        self.dispatcher.fail_meter(meter_id, &CommandError::ConnectionClosed);
                        self.publish_status(meter_id, false, None).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MeterWire for Inner {
    async fn send(&self, meter_id: &str, bytes: Vec<u8>) -> bool {
        let target = lock_poisonless(&self.registry).id_for_meter(meter_id).cloned();
        let Some(id) = target else {
            return false;
        };
        self.send_to_connection(&id, bytes).await
    }

    fn protocol(&self, meter_id: &str) -> Option<ProtocolKind> {
        self.protocol_of(meter_id)
    }
}

/// One accepted meter socket: register, pump bytes, clean up.
async fn handle_connection(
    inner: Arc<Inner>,
    stream: TcpStream,
    remote: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_id = {
        let registered = lock_poisonless(&inner.registry).register(remote, Instant::now());
        match registered {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(%remote, error = %err, "connection refused");
                let payload = json!({ "event": "connection-refused", "ip": remote.ip().to_string() });
                inner.publish_json(&inner.topics.gateway_events(), &payload, false).await;
                return;
            },
        }
    };

    let (mut read_half, mut write_half) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);
    let closer = Arc::new(Notify::new());
    {
        lock_poisonless(&inner.writers).insert(conn_id.clone(), writer_tx);
        lock_poisonless(&inner.closers).insert(conn_id.clone(), Arc::clone(&closer));
    }

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            if let Err(err) = write_half.write_all(&bytes).await {
                tracing::debug!(error = %err, "socket write failed");
                break;
            }
        }
    });

    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = closer.notified() => break,
            _ = shutdown.changed() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let events = {
                        lock_poisonless(&inner.registry).ingest(&conn_id, &buf[..n], Instant::now())
                    };
                    match events {
                        Ok(events) => process_events(&inner, &conn_id, remote, events).await,
                        // Connection was removed under us (replaced or swept).
                        Err(_) => break,
                    }
                },
                Err(err) => {
                    tracing::debug!(connection = %conn_id, error = %err, "socket read failed");
                    break;
                },
            },
        }
    }

    {
        lock_poisonless(&inner.writers).remove(&conn_id);
        lock_poisonless(&inner.closers).remove(&conn_id);
    }
    writer_task.abort();

    let closed = lock_poisonless(&inner.registry).close(&conn_id, "socket closed");
    if let Some(closed) = closed {
        tracing::info!(
            connection = %conn_id,
            frames_in = closed.stats.frames_received,
            frames_out = closed.stats.frames_sent,
            bytes_in = closed.stats.bytes_received,
            bytes_out = closed.stats.bytes_sent,
            "connection finished"
        );
        if let Some(meter_id) = &closed.meter_id {
            if closed.was_current_binding {
                inner.dispatcher.fail_meter(meter_id, &CommandError::ConnectionClosed);
                inner.publish_status(meter_id, false, None).await;
                inner
                    .publish_event(meter_id, "disconnected", json!({ "ip": remote.ip().to_string() }))
                    .await;
            }
        }
    }
}

/// Fan decoded inbound events out to identity, correlation and egress.
async fn process_events(
    inner: &Arc<Inner>,
    conn_id: &ConnectionId,
    remote: SocketAddr,
    events: Vec<InboundEvent>,
) {
    for event in events {
        match event {
            InboundEvent::R645(response) => handle_r645(inner, conn_id, remote, response).await,
            InboundEvent::Heartbeat(hb) => handle_heartbeat(inner, conn_id, remote, hb).await,
            InboundEvent::Apdu { apdu, .. } => handle_apdu(inner, conn_id, apdu).await,
            InboundEvent::Diagnostic { preview, reason } => {
                handle_diagnostic(inner, conn_id, &preview, &reason).await;
            },
        }
    }
}

fn response_address(response: &r645::Response) -> &str {
    match response {
        r645::Response::Read { address, .. }
        | r645::Response::WriteAck { address }
        | r645::Response::RelayAck { address }
        | r645::Response::Address { address }
        | r645::Response::Error { address, .. } => address,
    }
}

async fn handle_r645(
    inner: &Arc<Inner>,
    conn_id: &ConnectionId,
    remote: SocketAddr,
    response: r645::Response,
) {
    let address = response_address(&response).to_string();
    if address != BROADCAST_WILDCARD && address != BROADCAST_NINES {
        ensure_identified(inner, conn_id, remote, &address).await;
    }

    if !inner.dispatcher.resolve_r645(&address, &response) {
        // Nothing was waiting; unsolicited reads still become telemetry.
        if let r645::Response::Read { value, .. } = &response {
            let record = TelemetryRecord::from_register(&address, value, unix_ms());
            inner.publish_telemetry(&record).await;
        } else {
            tracing::debug!(meter = %address, "unmatched R645 response");
        }
    }
}

async fn handle_heartbeat(
    inner: &Arc<Inner>,
    conn_id: &ConnectionId,
    remote: SocketAddr,
    hb: Heartbeat,
) {
    let meter_id = if hb.is_zero_identity()
        && inner.config.heartbeat.zero_address_action == ZeroAddressAction::UseIp
    {
        remote.ip().to_string()
    } else {
        hb.meter_id.clone()
    };

    ensure_identified(inner, conn_id, remote, &meter_id).await;
    inner.publish_event(&meter_id, "heartbeat", json!({ "ip": remote.ip().to_string() })).await;

    if inner.config.heartbeat.ack_enabled && !inner.ack_payload.is_empty() {
        inner.send_to_connection(conn_id, inner.ack_payload.clone()).await;
    }
}

async fn handle_apdu(inner: &Arc<Inner>, conn_id: &ConnectionId, apdu: Apdu) {
    let meter_id = lock_poisonless(&inner.registry)
        .connection(conn_id)
        .and_then(|conn| conn.meter_id().map(str::to_string));
    let Some(meter_id) = meter_id else {
        tracing::debug!(connection = %conn_id, tag = apdu.tag(), "APDU before identification");
        return;
    };

    match inner.dispatcher.resolve_apdu(&meter_id, &apdu) {
        ApduMatch::Waiter => {},
        ApduMatch::Poll { obis } => {
            if let Apdu::GetResponse { result: GetResult::Data(value), .. } = &apdu {
                let record = TelemetryRecord::from_obis(&meter_id, obis, value, unix_ms());
                inner.publish_telemetry(&record).await;
            } else {
                tracing::debug!(meter = %meter_id, obis = %obis, "poll GET failed");
            }
        },
        ApduMatch::Unmatched => match &apdu {
            Apdu::EventNotification { obis, attribute, value, .. } => {
                let record = TelemetryRecord::from_obis(&meter_id, *obis, value, unix_ms());
                inner.publish_telemetry(&record).await;
                inner
                    .publish_event(
                        &meter_id,
                        "event-notification",
                        json!({
                            "obis": obis.to_string(),
                            "attribute": attribute,
                            "value": telemetry::data_value_json(value),
                        }),
                    )
                    .await;
            },
            Apdu::DataNotification { long_invoke_id, value, .. } => {
                inner
                    .publish_event(
                        &meter_id,
                        "data-notification",
                        json!({
                            "longInvokeId": long_invoke_id,
                            "data": telemetry::data_value_json(value),
                        }),
                    )
                    .await;
            },
            Apdu::Exception { state_error, service_error } => {
                inner
                    .publish_event(
                        &meter_id,
                        "exception",
                        json!({ "stateError": state_error, "serviceError": service_error }),
                    )
                    .await;
            },
            other => {
                tracing::debug!(meter = %meter_id, tag = other.tag(), "unmatched APDU");
            },
        },
    }
}

async fn handle_diagnostic(
    inner: &Arc<Inner>,
    conn_id: &ConnectionId,
    preview: &str,
    reason: &str,
) {
    tracing::debug!(connection = %conn_id, preview, reason, "parse diagnostic");
    let meter_id = lock_poisonless(&inner.registry)
        .connection(conn_id)
        .and_then(|conn| conn.meter_id().map(str::to_string));
    if let Some(meter_id) = meter_id {
        inner
            .publish_event(&meter_id, "parse-error", json!({ "preview": preview, "reason": reason }))
            .await;
    }
}

/// Bind a meter identity to its connection and publish presence.
async fn ensure_identified(
    inner: &Arc<Inner>,
    conn_id: &ConnectionId,
    remote: SocketAddr,
    meter_id: &str,
) {
    let outcome = {
        let mut registry = lock_poisonless(&inner.registry);
        match registry.identify(conn_id, meter_id) {
            Ok(outcome) => outcome,
            Err(_) => return,
        }
    };

    match outcome {
        IdentifyOutcome::AlreadyBound => {},
        IdentifyOutcome::Identified => {
            let ip = remote.ip().to_string();
            tracing::info!(meter = meter_id, %ip, "meter identified");
            inner.publish_status(meter_id, true, Some(&ip)).await;
            inner.publish_event(meter_id, "connected", json!({ "ip": ip })).await;
            maybe_auto_associate(inner, meter_id).await;
        },
        IdentifyOutcome::Replaced { previous } => {
            // Pending commands on the superseded connection fail, then its
            // socket goes away.
            inner
                .dispatcher
                .fail_meter(meter_id, &CommandError::ReplacedByNewerConnection);
            inner.trigger_close(&previous);

            let ip = remote.ip().to_string();
            inner.publish_status(meter_id, true, Some(&ip)).await;
            inner
                .publish_event(meter_id, "replaced", json!({ "ip": ip, "previous": previous.0 }))
                .await;
            maybe_auto_associate(inner, meter_id).await;
        },
    }
}

/// Kick one association/read cycle right after identification.
async fn maybe_auto_associate(inner: &Arc<Inner>, meter_id: &str) {
    if !inner.config.dlms.enabled || !inner.config.dlms.auto_associate {
        return;
    }
    if inner.protocol_of(meter_id) != Some(ProtocolKind::Vw) {
        return;
    }
    let inner = Arc::clone(inner);
    let meter_id = meter_id.to_string();
    tokio::spawn(async move {
        poller::poll_vw_meter(&inner, &meter_id).await;
    });
}

/// Bus command subscription: decode, execute, respond.
async fn command_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut rx = inner.bus.subscribe(&inner.topics.command_request_filter()).await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = rx.recv() => match message {
                Some(message) => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        handle_command_message(inner, message.topic, message.payload).await;
                    });
                },
                None => break,
            },
        }
    }
}

async fn handle_command_message(inner: Arc<Inner>, topic: String, payload: Vec<u8>) {
    let Some(meter_id) = inner.topics.meter_from_request_topic(&topic) else {
        tracing::debug!(%topic, "command on unparseable topic");
        return;
    };

    let response = match command::parse_request(&payload) {
        Ok(request) => {
            tracing::debug!(meter = %meter_id, id = %request.id, "command accepted");
            match commands::execute(&inner, &meter_id, &request.kind).await {
                Ok(result) => CommandResponse::ok(request.id, result, unix_ms()),
                Err(err) => {
                    tracing::warn!(meter = %meter_id, error = %err, "command failed");
                    CommandResponse::fail(request.id, &err, unix_ms())
                },
            }
        },
        Err(err) => {
            // Echo whatever id the requester managed to provide.
            let id = serde_json::from_slice::<Value>(&payload)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            CommandResponse::fail(id, &err, unix_ms())
        },
    };

    let topic = inner.topics.command_response(&meter_id);
    let payload = serde_json::to_value(&response).unwrap_or(Value::Null);
    inner.publish_json(&topic, &payload, false).await;
}

/// Periodic maintenance: idle/timeout sweeping, stale pending reaping and
/// address probes for silent R645 connections.
async fn sweep_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut registry_tick = tokio::time::interval(inner.config.heartbeat_interval());
    let mut stale_tick = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = registry_tick.tick() => {
                let actions = lock_poisonless(&inner.registry).sweep(Instant::now());
                for action in actions {
                    match action {
                        SweepAction::WentIdle(id) => {
                            tracing::debug!(connection = %id, "connection idle");
                        },
                        SweepAction::ForceClose(id) => {
                            tracing::info!(connection = %id, "closing inactive connection");
                            inner.trigger_close(&id);
                        },
                    }
                }
                probe_unidentified(&inner).await;
            },
            _ = stale_tick.tick() => {
                let reaped = inner.dispatcher.sweep_stale(Instant::now());
                if reaped > 0 {
                    tracing::debug!(reaped, "stale pending entries reaped");
                }
            },
        }
    }
}

/// Broadcast an address-discover frame on R645 connections that never
/// identified (single-meter lines answer with their address).
async fn probe_unidentified(inner: &Arc<Inner>) {
    let targets: Vec<ConnectionId> = {
        let registry = lock_poisonless(&inner.registry);
        registry
            .connections()
            .filter(|conn| conn.protocol() == Some(ProtocolKind::R645) && conn.meter_id().is_none())
            .map(|conn| conn.id().clone())
            .collect()
    };
    if targets.is_empty() {
        return;
    }

    let Ok(frame) = read_address_request().encode() else {
        return;
    };
    for id in targets {
        tracing::debug!(connection = %id, "probing unidentified connection");
        inner.send_to_connection(&id, frame.clone()).await;
    }
}
