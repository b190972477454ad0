//! Command execution against connected meters.
//!
//! Each supported method maps to a wire sequence per the meter's protocol
//! binding. R645 commands are single request/response exchanges correlated
//! by data identifier; DLMS commands run a full AARQ–operation–RLRQ bracket
//! under the per-meter association lock.

use std::time::{SystemTime, UNIX_EPOCH};

use metergate_core::{
    command::{CommandKind, RegisterTarget, RelayState},
    error::CommandError,
    poll::resolve_plan,
    telemetry::{RelayStateReading, TelemetryRecord},
};
use metergate_proto::{
    obis::{class, ObisCategory, ObisDescriptor, DISCONNECT_CONTROL_OBIS},
    r645::{self, read_request, relay_authenticated, relay_request, MeterDateTime, RelayCommand},
    ProtocolKind,
};
use serde_json::{json, Value};

use crate::{
    dispatcher::{MeterWire, R645Key},
    gateway::Inner,
    unix_ms,
};

/// Disconnect-control method indices.
const METHOD_DISCONNECT: u8 = 1;
const METHOD_RECONNECT: u8 = 2;

/// Execute a validated command against a meter.
pub(crate) async fn execute(
    inner: &Inner,
    meter_id: &str,
    kind: &CommandKind,
) -> Result<Value, CommandError> {
    let protocol = inner
        .protocol_of(meter_id)
        .ok_or_else(|| CommandError::MeterNotConnected(meter_id.to_string()))?;

    match kind {
        CommandKind::ReadRegister { target } => read_register(inner, meter_id, protocol, target).await,
        CommandKind::ReadAll => read_all(inner, meter_id, protocol).await,
        CommandKind::RelayControl { state } => relay_control(inner, meter_id, protocol, *state).await,
        CommandKind::ReadRelayState => read_relay_state(inner, meter_id, protocol).await,
        CommandKind::ReadAddress => Ok(json!({ "address": meter_id })),
        CommandKind::BroadcastTime => broadcast_time(inner, meter_id, protocol).await,
    }
}

/// Fire-and-forget time broadcast on the meter's line.
async fn broadcast_time(
    inner: &Inner,
    meter_id: &str,
    protocol: ProtocolKind,
) -> Result<Value, CommandError> {
    if protocol != ProtocolKind::R645 {
        return Err(CommandError::ProtocolMismatch { required: ProtocolKind::R645 });
    }
    let frame = r645::broadcast_time(meter_datetime_now())
        .and_then(|frame| frame.encode())
        .map_err(|e| CommandError::Invalid(format!("cannot build time frame: {e}")))?;
    if !inner.send(meter_id, frame).await {
        return Err(CommandError::MeterNotConnected(meter_id.to_string()));
    }
    Ok(json!({ "sent": true }))
}

async fn read_register(
    inner: &Inner,
    meter_id: &str,
    protocol: ProtocolKind,
    target: &RegisterTarget,
) -> Result<Value, CommandError> {
    match (protocol, target) {
        (ProtocolKind::R645, RegisterTarget::R645(descriptor)) => {
            read_r645(inner, meter_id, descriptor.di).await
        },
        (ProtocolKind::R645, RegisterTarget::RawDi(di)) => read_r645(inner, meter_id, *di).await,
        (ProtocolKind::R645, RegisterTarget::Obis(_)) => {
            Err(CommandError::ProtocolMismatch { required: ProtocolKind::Vw })
        },
        (ProtocolKind::Vw, RegisterTarget::Obis(descriptor)) => {
            read_obis(inner, meter_id, *descriptor).await
        },
        (ProtocolKind::Vw, _) => {
            Err(CommandError::ProtocolMismatch { required: ProtocolKind::R645 })
        },
    }
}

async fn read_r645(inner: &Inner, meter_id: &str, di: u32) -> Result<Value, CommandError> {
    let frame = read_request(meter_id, di);
    let timeout = inner.dispatcher().timing().command_timeout;
    let response = inner
        .dispatcher()
        .send_r645(inner, meter_id, &frame, R645Key::Di(di), timeout)
        .await?;

    let r645::Response::Read { value, .. } = response else {
        return Err(CommandError::Invalid("unexpected response kind".to_string()));
    };
    let record = TelemetryRecord::from_register(meter_id, &value, unix_ms());
    Ok(register_result(&record, value.state))
}

async fn read_obis(
    inner: &Inner,
    meter_id: &str,
    descriptor: &'static ObisDescriptor,
) -> Result<Value, CommandError> {
    let dispatcher = inner.dispatcher();
    let guard = dispatcher
        .associate(inner, meter_id, dispatcher.timing().lock_timeout)
        .await?;

    let result = dispatcher
        .get(inner, meter_id, class_for_category(descriptor.category), descriptor.code, 2)
        .await;

    dispatcher.release(inner, meter_id).await;
    drop(guard);

    let value = result?;
    let record = TelemetryRecord::from_obis(meter_id, descriptor.code, &value, unix_ms());
    Ok(register_result(&record, None))
}

async fn read_all(
    inner: &Inner,
    meter_id: &str,
    protocol: ProtocolKind,
) -> Result<Value, CommandError> {
    if protocol != ProtocolKind::R645 {
        return Err(CommandError::ProtocolMismatch { required: ProtocolKind::R645 });
    }

    let polling = &inner.config().polling;
    let plan = resolve_plan(polling.register_group, &polling.custom_registers);
    let timeout = inner.dispatcher().timing().command_timeout;

    let mut values = serde_json::Map::new();
    let mut errors = serde_json::Map::new();

    // Sequential reads; each failure stays isolated to its register.
    for descriptor in &plan.r645 {
        let frame = read_request(meter_id, descriptor.di);
        match inner
            .dispatcher()
            .send_r645(inner, meter_id, &frame, R645Key::Di(descriptor.di), timeout)
            .await
        {
            Ok(r645::Response::Read { value, .. }) => {
                let record = TelemetryRecord::from_register(meter_id, &value, unix_ms());
                values.insert(descriptor.key.to_string(), register_result(&record, value.state));
            },
            Ok(_) => {
                errors.insert(descriptor.key.to_string(), json!("unexpected response kind"));
            },
            Err(err) => {
                errors.insert(descriptor.key.to_string(), json!(err.to_string()));
            },
        }
    }

    Ok(json!({ "values": values, "errors": errors }))
}

async fn relay_control(
    inner: &Inner,
    meter_id: &str,
    protocol: ProtocolKind,
    state: RelayState,
) -> Result<Value, CommandError> {
    match protocol {
        ProtocolKind::R645 => relay_control_r645(inner, meter_id, state).await,
        ProtocolKind::Vw => relay_control_dlms(inner, meter_id, state).await,
    }
}

async fn relay_control_r645(
    inner: &Inner,
    meter_id: &str,
    state: RelayState,
) -> Result<Value, CommandError> {
    let command = match state {
        RelayState::Open => RelayCommand::Trip,
        RelayState::Close => RelayCommand::Close,
    };

    let relay = &inner.config().r645;
    let frame = match relay.relay_aes_key()? {
        Some(key) => relay_authenticated(
            meter_id,
            command,
            &key,
            relay.operator()?,
            relay.password()?,
            meter_datetime_now(),
        )
        .map_err(|e| CommandError::Invalid(format!("cannot build relay frame: {e}")))?,
        None => relay_request(meter_id, command),
    };

    let timeout = inner.dispatcher().timing().command_timeout;
    match inner
        .dispatcher()
        .send_r645(inner, meter_id, &frame, R645Key::Relay, timeout)
        .await
    {
        Ok(_) => Ok(json!({ "state": state, "sent": true, "confirmed": true })),
        // Some firmware executes the relay command without ever answering;
        // success here means "command sent", not "relay observed".
        Err(CommandError::CommandTimeout) => {
            Ok(json!({ "state": state, "sent": true, "confirmed": false }))
        },
        Err(err) => Err(err),
    }
}

async fn relay_control_dlms(
    inner: &Inner,
    meter_id: &str,
    state: RelayState,
) -> Result<Value, CommandError> {
    let dispatcher = inner.dispatcher();
    let timing = dispatcher.timing().clone();
    let guard = dispatcher
        .associate(inner, meter_id, timing.relay_lock_timeout)
        .await?;

    let result = async {
        let method = match state {
            RelayState::Open => METHOD_DISCONNECT,
            RelayState::Close => METHOD_RECONNECT,
        };
        dispatcher
            .action(inner, meter_id, class::DISCONNECT_CONTROL, DISCONNECT_CONTROL_OBIS, method)
            .await?;

        // Let the switch settle before confirming the output state.
        tokio::time::sleep(timing.relay_confirm_delay).await;

        let output = dispatcher
            .get(inner, meter_id, class::DISCONNECT_CONTROL, DISCONNECT_CONTROL_OBIS, 2)
            .await?;
        Ok::<_, CommandError>(output)
    }
    .await;

    dispatcher.release(inner, meter_id).await;
    drop(guard);

    let output = result?;
    let reading = RelayStateReading {
        output_state: output.as_bool().unwrap_or(false),
        control_state: None,
    };
    let mut payload = reading.result_payload();
    payload["requested"] = json!(state);
    payload["confirmed"] = json!(true);
    Ok(payload)
}

async fn read_relay_state(
    inner: &Inner,
    meter_id: &str,
    protocol: ProtocolKind,
) -> Result<Value, CommandError> {
    if protocol != ProtocolKind::Vw {
        return Err(CommandError::ProtocolMismatch { required: ProtocolKind::Vw });
    }

    let dispatcher = inner.dispatcher();
    let guard = dispatcher
        .associate(inner, meter_id, dispatcher.timing().lock_timeout)
        .await?;

    let result = async {
        let output = dispatcher
            .get(inner, meter_id, class::DISCONNECT_CONTROL, DISCONNECT_CONTROL_OBIS, 2)
            .await?;
        let control = dispatcher
            .get(inner, meter_id, class::DISCONNECT_CONTROL, DISCONNECT_CONTROL_OBIS, 3)
            .await?;
        Ok::<_, CommandError>((output, control))
    }
    .await;

    dispatcher.release(inner, meter_id).await;
    drop(guard);

    let (output, control) = result?;
    let reading = RelayStateReading {
        output_state: output.as_bool().unwrap_or(false),
        control_state: control.as_i64(),
    };
    Ok(reading.result_payload())
}

/// COSEM class used to read an OBIS object.
pub(crate) fn class_for_category(category: ObisCategory) -> u16 {
    match category {
        ObisCategory::Relay => class::DISCONNECT_CONTROL,
        ObisCategory::Identity | ObisCategory::Clock => class::DATA,
        _ => class::REGISTER,
    }
}

fn register_result(record: &TelemetryRecord, state: Option<&'static str>) -> Value {
    let mut payload = json!({
        "register": record.key,
        "raw": record.raw,
        "value": record.scaled,
        "unit": record.unit,
    });
    if record.scaled.is_none() {
        payload["value"] = serde_json::to_value(&record.raw).unwrap_or(Value::Null);
    }
    if let Some(state) = state {
        payload["state"] = json!(state);
    }
    payload
}

/// Current wall clock as an R645 calendar timestamp.
pub(crate) fn meter_datetime_now() -> MeterDateTime {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    MeterDateTime {
        year: year as u16,
        month,
        day,
        hour: (rem / 3600) as u8,
        minute: (rem % 3600 / 60) as u8,
        second: (rem % 60) as u8,
    }
}

/// Days-since-epoch to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u8, u8) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_conversion_known_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1)); // 2024-01-01
        assert_eq!(civil_from_days(20_300), (2025, 7, 31));
    }

    #[test]
    fn datetime_now_is_plausible() {
        let now = meter_datetime_now();
        assert!(now.year >= 2026);
        assert!((1..=12).contains(&now.month));
        assert!((1..=31).contains(&now.day));
        assert!(now.hour < 24);
        assert!(now.minute < 60);
        assert!(now.second < 60);
    }

    #[test]
    fn category_class_mapping() {
        assert_eq!(class_for_category(ObisCategory::Relay), 70);
        assert_eq!(class_for_category(ObisCategory::Identity), 1);
        assert_eq!(class_for_category(ObisCategory::Energy), 3);
        assert_eq!(class_for_category(ObisCategory::Voltage), 3);
    }
}
