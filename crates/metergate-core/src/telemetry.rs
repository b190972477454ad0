//! Egress mapping: decoded frames and APDUs to the bus-facing schema.
//!
//! Parsers return raw integers paired with scaling metadata; the
//! multiplication to engineering units happens here and nowhere else.
//! Unknown registers and OBIS codes still produce telemetry, with the raw
//! value, a null unit and the original key.

use metergate_proto::{
    apdu::DataValue,
    obis::{self, ObisCode},
    r645::RegisterValue,
    ProtocolKind,
};
use serde::Serialize;
use serde_json::{json, Value};

/// Raw value as carried on the bus, before scaling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Text.
    Text(String),
    /// Opaque bytes, hex encoded.
    Bytes(String),
}

impl RawValue {
    /// Map a DLMS data value to its raw bus form.
    pub fn from_data_value(value: &DataValue) -> RawValue {
        match value {
            DataValue::Boolean(v) => RawValue::Bool(*v),
            DataValue::VisibleString(s) | DataValue::Utf8String(s) => RawValue::Text(s.clone()),
            DataValue::OctetString(bytes) => RawValue::Bytes(to_hex(bytes)),
            DataValue::Float32(v) => RawValue::Float(f64::from(*v)),
            DataValue::Float64(v) => RawValue::Float(*v),
            DataValue::Long64Unsigned(v) => RawValue::UInt(*v),
            other => match other.as_i64() {
                Some(v) => RawValue::Int(v),
                None => {
                    let mut wire = Vec::new();
                    other.encode(&mut wire);
                    RawValue::Bytes(to_hex(&wire))
                },
            },
        }
    }
}

/// One telemetry reading in the neutral schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// Meter identity.
    pub meter_id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Register key or OBIS code string.
    pub key: String,
    /// Raw decoded value.
    pub raw: RawValue,
    /// Engineering-unit value, when scaling metadata exists.
    pub scaled: Option<f64>,
    /// Unit label, when known.
    pub unit: Option<String>,
    /// Which protocol produced the reading.
    pub source: ProtocolSource,
    /// Original data identifier (R645 readings only), hex encoded.
    pub data_id: Option<String>,
}

/// Protocol source tag in the bus schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolSource {
    /// BCD register protocol.
    R645,
    /// DLMS over the VW wrapper.
    Dlms,
}

impl From<ProtocolKind> for ProtocolSource {
    fn from(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::R645 => ProtocolSource::R645,
            ProtocolKind::Vw => ProtocolSource::Dlms,
        }
    }
}

impl TelemetryRecord {
    /// Map a decoded R645 register value.
    pub fn from_register(meter_id: &str, value: &RegisterValue, timestamp: u64) -> Self {
        Self {
            meter_id: meter_id.to_string(),
            timestamp,
            key: value.key(),
            raw: RawValue::Int(value.raw),
            scaled: value.scaled(),
            unit: value.unit().map(str::to_string),
            source: ProtocolSource::R645,
            data_id: Some(format!("{:08X}", value.di)),
        }
    }

    /// Map a DLMS value read from (or notified for) an OBIS object.
    pub fn from_obis(
        meter_id: &str,
        code: ObisCode,
        value: &DataValue,
        timestamp: u64,
    ) -> Self {
        let descriptor = obis::by_code(code);
        let raw = RawValue::from_data_value(value);
        let numeric = value.as_f64();
        let scaled = match descriptor {
            Some(d) => match d.scaler {
                Some(scaler) => numeric.map(|n| n * scaler),
                None => numeric,
            },
            None => None,
        };
        Self {
            meter_id: meter_id.to_string(),
            timestamp,
            key: descriptor.map_or_else(|| code.to_string(), |d| d.key.to_string()),
            raw,
            scaled,
            unit: descriptor.and_then(|d| d.unit).map(str::to_string),
            source: ProtocolSource::Dlms,
            data_id: None,
        }
    }

    /// Single-value telemetry payload.
    pub fn bus_payload(&self) -> Value {
        let mut payload = json!({
            "meterId": self.meter_id,
            "timestamp": self.timestamp,
            "register": self.key,
            "value": self.value_field(),
            "unit": self.unit,
            "source": self.source,
        });
        if let Some(data_id) = &self.data_id {
            payload["dataId"] = json!(data_id);
        }
        payload
    }

    /// Scaled value when available, raw otherwise.
    fn value_field(&self) -> Value {
        match self.scaled {
            Some(scaled) => json!(scaled),
            None => serde_json::to_value(&self.raw).unwrap_or(Value::Null),
        }
    }
}

/// Batch telemetry payload: `{meterId, timestamp, values: {key: {...}}}`.
pub fn batch_payload(meter_id: &str, timestamp: u64, records: &[TelemetryRecord]) -> Value {
    let mut values = serde_json::Map::new();
    for record in records {
        let mut entry = serde_json::Map::new();
        entry.insert("value".to_string(), record.value_field());
        entry.insert(
            "unit".to_string(),
            record.unit.as_deref().map_or(Value::Null, |u| json!(u)),
        );
        values.insert(record.key.clone(), Value::Object(entry));
    }
    json!({
        "meterId": meter_id,
        "timestamp": timestamp,
        "values": Value::Object(values),
    })
}

/// Retained per-meter status payload.
pub fn status_payload(
    meter_id: &str,
    online: bool,
    ip: Option<&str>,
    last_seen: Option<u64>,
    disconnected_at: Option<u64>,
) -> Value {
    let mut payload = json!({
        "meterId": meter_id,
        "online": online,
    });
    if let Some(ip) = ip {
        payload["ip"] = json!(ip);
    }
    if let Some(last_seen) = last_seen {
        payload["lastSeen"] = json!(last_seen);
    }
    if let Some(disconnected_at) = disconnected_at {
        payload["disconnectedAt"] = json!(disconnected_at);
    }
    payload
}

/// Per-meter event payload.
pub fn event_payload(meter_id: &str, event: &str, data: Value, ts: u64) -> Value {
    json!({
        "meterId": meter_id,
        "event": event,
        "data": data,
        "ts": ts,
    })
}

/// Retained gateway status payload.
pub fn gateway_status_payload(online: bool, version: &str, uptime_secs: u64) -> Value {
    json!({
        "status": if online { "online" } else { "offline" },
        "version": version,
        "uptime": uptime_secs,
    })
}

/// Decoded relay state pair from the DLMS disconnect-control object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RelayStateReading {
    /// Attribute 2: whether the output is physically connected.
    pub output_state: bool,
    /// Attribute 3: control-state enum value.
    pub control_state: Option<i64>,
}

impl RelayStateReading {
    /// Command-result payload.
    pub fn result_payload(&self) -> Value {
        json!({
            "outputState": self.output_state,
            "state": if self.output_state { "closed" } else { "open" },
            "controlState": self.control_state,
        })
    }
}

/// JSON projection of a DLMS data value, used for notification events.
pub fn data_value_json(value: &DataValue) -> Value {
    match value {
        DataValue::Null => Value::Null,
        DataValue::Boolean(v) => json!(v),
        DataValue::VisibleString(s) | DataValue::Utf8String(s) => json!(s),
        DataValue::OctetString(bytes) => json!(to_hex(bytes)),
        DataValue::Float32(v) => json!(v),
        DataValue::Float64(v) => json!(v),
        DataValue::Long64Unsigned(v) => json!(v),
        DataValue::Array(elements) | DataValue::Structure(elements) => {
            Value::Array(elements.iter().map(data_value_json).collect())
        },
        DataValue::DateTime(dt) => json!({
            "year": dt.year,
            "month": dt.month,
            "day": dt.day,
            "hour": dt.hour,
            "minute": dt.minute,
            "second": dt.second,
        }),
        other => match other.as_i64() {
            Some(v) => json!(v),
            None => {
                let mut wire = Vec::new();
                other.encode(&mut wire);
                json!(to_hex(&wire))
            },
        },
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
