//! End-to-end DLMS/VW flows over real TCP sockets.

mod common;

use common::{next_json, next_json_matching, start_gateway, wrapped_aare, wrapped_heartbeat, FakeMeter};
use metergate_proto::vw;
use metergate_server::{Bus, DlmsConfig, GatewayConfig, HeartbeatConfig};
use serde_json::json;

const METER: &str = "000000005678";

fn test_config() -> GatewayConfig {
    GatewayConfig {
        command_timeout_ms: 1_000,
        dlms: DlmsConfig {
            association_timeout_ms: 500,
            query_timeout_ms: 1_000,
            ..DlmsConfig::default()
        },
        ..GatewayConfig::default()
    }
}

#[tokio::test]
async fn heartbeat_identifies_meter() {
    let gw = start_gateway(test_config()).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;
    let mut events = gw.bus.subscribe("metergate/v1/meters/+/events").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat(METER)).await;

    let (topic, value) = next_json(&mut status).await;
    assert_eq!(topic, format!("metergate/v1/meters/{METER}/status"));
    assert_eq!(value["online"], true);

    let (_, value) = next_json_matching(&mut events, |_, v| v["event"] == "heartbeat").await;
    assert_eq!(value["meterId"], METER);

    gw.handle.shutdown();
}

#[tokio::test]
async fn heartbeat_ack_written_when_configured() {
    let config = GatewayConfig {
        heartbeat: HeartbeatConfig {
            ack_enabled: true,
            ack_payload_hex: "0d0a".to_string(),
            ..HeartbeatConfig::default()
        },
        ..test_config()
    };
    let gw = start_gateway(config).await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat(METER)).await;

    assert_eq!(meter.read_exact(2).await, vec![0x0D, 0x0A]);

    gw.handle.shutdown();
}

#[tokio::test]
async fn relay_control_runs_full_dlms_sequence() {
    let gw = start_gateway(test_config()).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;
    let mut responses = gw.bus.subscribe("metergate/v1/meters/+/command/response").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat(METER)).await;
    let _ = next_json(&mut status).await;

    gw.bus
        .publish(
            &format!("metergate/v1/meters/{METER}/command/request"),
            json!({"id": "relay-1", "method": "relay_control", "params": {"state": "open"}})
                .to_string()
                .into_bytes(),
            false,
        )
        .await;

    // 1. AARQ
    let aarq = meter.read_wrapped().await;
    assert_eq!(aarq[0], 0x60);
    meter.send(&wrapped_aare(true)).await;

    // 2. ACTION.request: class 70, OBIS 0-0:96.3.10.255, method 1.
    let action = meter.read_wrapped().await;
    assert_eq!(action[0], 0xC3);
    assert_eq!(u16::from_be_bytes([action[3], action[4]]), 70);
    assert_eq!(&action[5..11], &[0, 0, 96, 3, 10, 255]);
    assert_eq!(action[11], 1);
    let invoke = action[2];
    let action_ok = vw::wrap(vw::DLMS_DESTINATION, &[0xC7, 0x01, invoke, 0x00, 0x00]);
    meter.send(&action_ok).await;

    // 3. Confirmation GET for attribute 2 after the settle delay.
    let get = meter.read_wrapped().await;
    assert_eq!(get[0], 0xC0);
    assert_eq!(&get[5..11], &[0, 0, 96, 3, 10, 255]);
    assert_eq!(get[11], 2);
    let get_invoke = get[2];
    // Output state false: relay is open.
    let get_ok =
        vw::wrap(vw::DLMS_DESTINATION, &[0xC4, 0x01, get_invoke, 0x00, 0x03, 0x00]);
    meter.send(&get_ok).await;

    // 4. RLRQ closes the bracket.
    let rlrq = meter.read_wrapped().await;
    assert_eq!(rlrq[0], 0x62);

    let (_, value) = next_json(&mut responses).await;
    assert_eq!(value["id"], "relay-1");
    assert_eq!(value["success"], true);
    assert_eq!(value["result"]["state"], "open");
    assert_eq!(value["result"]["outputState"], false);
    assert_eq!(value["result"]["requested"], "open");

    gw.handle.shutdown();
}

#[tokio::test]
async fn rejected_association_fails_relay_command() {
    let gw = start_gateway(test_config()).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;
    let mut responses = gw.bus.subscribe("metergate/v1/meters/+/command/response").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat(METER)).await;
    let _ = next_json(&mut status).await;

    gw.bus
        .publish(
            &format!("metergate/v1/meters/{METER}/command/request"),
            json!({"id": "relay-2", "method": "relay_control", "params": {"state": "close"}})
                .to_string()
                .into_bytes(),
            false,
        )
        .await;

    let _aarq = meter.read_wrapped().await;
    meter.send(&wrapped_aare(false)).await;

    let (_, value) = next_json(&mut responses).await;
    assert_eq!(value["id"], "relay-2");
    assert_eq!(value["success"], false);
    assert!(value["error"].as_str().unwrap().contains("association"));

    gw.handle.shutdown();
}

#[tokio::test]
async fn association_timeout_fails_read() {
    let gw = start_gateway(test_config()).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;
    let mut responses = gw.bus.subscribe("metergate/v1/meters/+/command/response").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat(METER)).await;
    let _ = next_json(&mut status).await;

    gw.bus
        .publish(
            &format!("metergate/v1/meters/{METER}/command/request"),
            json!({
                "id": "read-1",
                "method": "read_register",
                "params": {"register": "ACTIVE_ENERGY_IMPORT"}
            })
            .to_string()
            .into_bytes(),
            false,
        )
        .await;

    // AARQ arrives but the meter never answers.
    let _aarq = meter.read_wrapped().await;

    let (_, value) = next_json(&mut responses).await;
    assert_eq!(value["success"], false);
    assert!(value["error"].as_str().unwrap().contains("association"));

    gw.handle.shutdown();
}

#[tokio::test]
async fn read_register_over_dlms() {
    let gw = start_gateway(test_config()).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;
    let mut responses = gw.bus.subscribe("metergate/v1/meters/+/command/response").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat(METER)).await;
    let _ = next_json(&mut status).await;

    gw.bus
        .publish(
            &format!("metergate/v1/meters/{METER}/command/request"),
            json!({
                "id": "read-2",
                "method": "read_register",
                "params": {"register": "ACTIVE_ENERGY_IMPORT"}
            })
            .to_string()
            .into_bytes(),
            false,
        )
        .await;

    let _aarq = meter.read_wrapped().await;
    meter.send(&wrapped_aare(true)).await;

    let get = meter.read_wrapped().await;
    assert_eq!(get[0], 0xC0);
    assert_eq!(&get[5..11], &[1, 0, 1, 8, 0, 255]);
    let invoke = get[2];

    // 1234567 Wh as double-long-unsigned.
    let mut reply = vec![0xC4, 0x01, invoke, 0x00, 0x06];
    reply.extend_from_slice(&1_234_567u32.to_be_bytes());
    meter.send(&vw::wrap(vw::DLMS_DESTINATION, &reply)).await;

    let _rlrq = meter.read_wrapped().await;

    let (_, value) = next_json(&mut responses).await;
    assert_eq!(value["success"], true);
    assert_eq!(value["result"]["register"], "ACTIVE_ENERGY_IMPORT");
    assert_eq!(value["result"]["value"], 1234.567);
    assert_eq!(value["result"]["unit"], "kWh");

    gw.handle.shutdown();
}

#[tokio::test]
async fn read_relay_state_reads_both_attributes() {
    let gw = start_gateway(test_config()).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;
    let mut responses = gw.bus.subscribe("metergate/v1/meters/+/command/response").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat(METER)).await;
    let _ = next_json(&mut status).await;

    gw.bus
        .publish(
            &format!("metergate/v1/meters/{METER}/command/request"),
            json!({"id": "relay-state-1", "method": "read_relay_state"})
                .to_string()
                .into_bytes(),
            false,
        )
        .await;

    let _aarq = meter.read_wrapped().await;
    meter.send(&wrapped_aare(true)).await;

    // Attribute 2: output state (true = closed).
    let get = meter.read_wrapped().await;
    assert_eq!(get[11], 2);
    meter
        .send(&vw::wrap(vw::DLMS_DESTINATION, &[0xC4, 0x01, get[2], 0x00, 0x03, 0x01]))
        .await;

    // Attribute 3: control state.
    let get = meter.read_wrapped().await;
    assert_eq!(get[11], 3);
    meter
        .send(&vw::wrap(vw::DLMS_DESTINATION, &[0xC4, 0x01, get[2], 0x00, 0x16, 0x02]))
        .await;

    let _rlrq = meter.read_wrapped().await;

    let (_, value) = next_json(&mut responses).await;
    assert_eq!(value["success"], true);
    assert_eq!(value["result"]["outputState"], true);
    assert_eq!(value["result"]["state"], "closed");
    assert_eq!(value["result"]["controlState"], 2);

    gw.handle.shutdown();
}

#[tokio::test]
async fn relay_state_on_r645_meter_is_protocol_mismatch() {
    let gw = start_gateway(test_config()).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;
    let mut responses = gw.bus.subscribe("metergate/v1/meters/+/command/response").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&common::r645_voltage_response("000000001234", &[0x00, 0x22])).await;
    let _ = next_json(&mut status).await;

    gw.bus
        .publish(
            "metergate/v1/meters/000000001234/command/request",
            json!({"id": "relay-state-2", "method": "read_relay_state"})
                .to_string()
                .into_bytes(),
            false,
        )
        .await;

    let (_, value) = next_json(&mut responses).await;
    assert_eq!(value["success"], false);
    assert!(value["error"].as_str().unwrap().contains("protocol"));

    gw.handle.shutdown();
}

#[tokio::test]
async fn event_notification_becomes_telemetry_and_event() {
    let gw = start_gateway(test_config()).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;
    let mut telemetry = gw.bus.subscribe("metergate/v1/meters/+/telemetry").await;
    let mut events = gw.bus.subscribe("metergate/v1/meters/+/events").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat(METER)).await;
    let _ = next_json(&mut status).await;

    // EventNotification: class 3, voltage L1, value 2305 (0.1 V steps).
    let mut notification = vec![0xC2];
    notification.extend_from_slice(&3u16.to_be_bytes());
    notification.push(0x06);
    notification.extend_from_slice(&[1, 0, 32, 7, 0, 255]);
    notification.push(2);
    notification.extend_from_slice(&[0x12, 0x09, 0x01]); // long-unsigned 2305
    meter.send(&vw::wrap(vw::DLMS_DESTINATION, &notification)).await;

    let (_, value) = next_json(&mut telemetry).await;
    assert_eq!(value["register"], "VOLTAGE_L1");
    assert_eq!(value["value"], 230.5);
    assert_eq!(value["unit"], "V");

    let (_, value) =
        next_json_matching(&mut events, |_, v| v["event"] == "event-notification").await;
    assert_eq!(value["data"]["obis"], "1-0:32.7.0.255");
    assert_eq!(value["data"]["value"], 2305);

    gw.handle.shutdown();
}

#[tokio::test]
async fn zero_identity_uses_ip_when_configured() {
    let config = GatewayConfig {
        heartbeat: HeartbeatConfig {
            zero_address_action: metergate_server::ZeroAddressAction::UseIp,
            ..HeartbeatConfig::default()
        },
        ..test_config()
    };
    let gw = start_gateway(config).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat("000000000000")).await;

    let (topic, value) = next_json(&mut status).await;
    assert!(topic.contains("127.0.0.1"));
    assert_eq!(value["meterId"], "127.0.0.1");

    gw.handle.shutdown();
}

#[tokio::test]
async fn disconnect_publishes_offline_status() {
    let gw = start_gateway(test_config()).await;
    let mut status = gw.bus.subscribe("metergate/v1/meters/+/status").await;

    let mut meter = FakeMeter::connect(gw.addr).await;
    meter.send(&wrapped_heartbeat(METER)).await;
    let (_, value) = next_json(&mut status).await;
    assert_eq!(value["online"], true);

    drop(meter);

    let (_, value) = next_json_matching(&mut status, |_, v| v["online"] == false).await;
    assert_eq!(value["meterId"], METER);
    assert!(value["disconnectedAt"].as_u64().is_some());

    gw.handle.shutdown();
}
