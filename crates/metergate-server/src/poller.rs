//! Periodic meter polling.
//!
//! Cycles run at the configured interval, staggering meters to avoid
//! synchronized bursts. R645 meters are read synchronously with retries;
//! VW meters get an association bracket with invoke-id batched GETs whose
//! responses flow back through the normal inbound pipeline. Passive-only
//! DLMS (the default) skips active polling and relies on unsolicited
//! notifications.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metergate_core::{
    poll::{resolve_plan, MeterPollOutcome, PollPlan},
    telemetry::TelemetryRecord,
};
use metergate_proto::{r645::{self, read_request}, ProtocolKind};
use serde_json::json;
use tokio::sync::watch;

use crate::{commands::class_for_category, dispatcher::R645Key, gateway::Inner, unix_ms};

/// Spacing between batched poll GETs to one meter.
const GET_SPACING: Duration = Duration::from_millis(200);

/// Backoff between retries of one R645 register read.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Poll loop entry point.
pub(crate) async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut tick =
        tokio::time::interval(Duration::from_millis(inner.config().polling.interval_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick completes immediately; wait a full period so
    // meters have a chance to register.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => cycle(&inner).await,
        }
    }
}

/// One poll cycle over every identified meter.
async fn cycle(inner: &Arc<Inner>) {
    let polling = &inner.config().polling;
    let plan = resolve_plan(polling.register_group, &polling.custom_registers);
    let stagger = Duration::from_millis(polling.stagger_ms);

    let meters = inner.identified_meters();
    tracing::debug!(meters = meters.len(), "poll cycle");

    for (index, (meter_id, _conn, protocol)) in meters.into_iter().enumerate() {
        if index > 0 && !stagger.is_zero() {
            tokio::time::sleep(stagger).await;
        }
        match protocol {
            Some(ProtocolKind::R645) => poll_r645_meter(inner, &meter_id, &plan).await,
            Some(ProtocolKind::Vw) => {
                let dlms = &inner.config().dlms;
                if dlms.enabled && !dlms.passive_only {
                    poll_vw_meter(inner, &meter_id).await;
                }
            },
            None => {},
        }
    }
}

/// Synchronous register sweep over one R645 meter.
async fn poll_r645_meter(inner: &Arc<Inner>, meter_id: &str, plan: &PollPlan) {
    let polling = &inner.config().polling;
    let timeout = Duration::from_millis(polling.timeout_ms);
    let mut outcome = MeterPollOutcome::new(meter_id);

    for descriptor in &plan.r645 {
        let frame = read_request(meter_id, descriptor.di);
        let mut attempt = 0;
        loop {
            let result = inner
                .dispatcher()
                .send_r645(inner.as_ref(), meter_id, &frame, R645Key::Di(descriptor.di), timeout)
                .await;
            match result {
                Ok(r645::Response::Read { value, .. }) => {
                    outcome
                        .readings
                        .push(TelemetryRecord::from_register(meter_id, &value, unix_ms()));
                    break;
                },
                Ok(_) => {
                    outcome
                        .errors
                        .push((descriptor.key.to_string(), "unexpected response kind".to_string()));
                    break;
                },
                Err(_) if attempt < polling.retries => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                },
                Err(err) => {
                    outcome.errors.push((descriptor.key.to_string(), err.to_string()));
                    break;
                },
            }
        }
    }

    if !outcome.readings.is_empty() {
        inner.publish_batch_telemetry(meter_id, &outcome.readings).await;
    }
    inner.publish_event(meter_id, outcome.event_name(), outcome.event_data()).await;
}

/// One association bracket with batched GETs for a VW meter.
///
/// Responses are not awaited here; they resolve through the inbound
/// pipeline by invoke id and a background sweep reaps entries that never
/// answer.
pub(crate) async fn poll_vw_meter(inner: &Arc<Inner>, meter_id: &str) {
    let polling = &inner.config().polling;
    let plan = resolve_plan(polling.register_group, &polling.custom_registers);
    if plan.dlms.is_empty() {
        let outcome = MeterPollOutcome::new(meter_id);
        inner.publish_event(meter_id, outcome.event_name(), outcome.event_data()).await;
        return;
    }

    let dispatcher = inner.dispatcher();
    let guard = match dispatcher
        .associate(inner.as_ref(), meter_id, dispatcher.timing().lock_timeout)
        .await
    {
        Ok(guard) => guard,
        Err(err) => {
            tracing::warn!(meter = meter_id, error = %err, "poll association failed");
            inner
                .publish_event(meter_id, "poll-failed", json!({ "error": err.to_string() }))
                .await;
            return;
        },
    };

    for descriptor in &plan.dlms {
        let class_id = class_for_category(descriptor.category);
        let sent = dispatcher
            .poll_get(inner.as_ref(), meter_id, class_id, descriptor.code, 2, Instant::now())
            .await;
        if !sent {
            tracing::debug!(meter = meter_id, "connection lost mid-poll");
            break;
        }
        tokio::time::sleep(GET_SPACING).await;
    }

    dispatcher.release(inner.as_ref(), meter_id).await;
    drop(guard);
}
