//! Shared helpers for gateway integration tests: a running gateway on an
//! ephemeral port, a fake meter on a raw TCP socket, and bus inspection.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use metergate_server::{Bus, BusMessage, Gateway, GatewayConfig, GatewayHandle, InMemoryBus};
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// A gateway running in the background with an in-process bus.
pub struct TestGateway {
    pub bus: Arc<InMemoryBus>,
    pub handle: GatewayHandle,
    pub addr: SocketAddr,
}

/// Start a gateway on an ephemeral port.
pub async fn start_gateway(mut config: GatewayConfig) -> TestGateway {
    config.listen_port = 0;
    let bus = Arc::new(InMemoryBus::new());
    let gateway = Gateway::bind(config, Arc::clone(&bus) as Arc<dyn Bus>)
        .await
        .expect("gateway should bind");
    let addr = gateway.local_addr().expect("bound address");
    let handle = gateway.handle();
    tokio::spawn(gateway.run());
    // Let the command subscription and sweepers come up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    TestGateway { bus, handle, addr }
}

/// A fake meter socket.
pub struct FakeMeter {
    pub stream: TcpStream,
}

impl FakeMeter {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to gateway");
        Self { stream }
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("meter write");
    }

    /// Read exactly `n` bytes or panic after the timeout.
    pub async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        timeout(RECV_TIMEOUT, self.stream.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .expect("meter read");
        buf
    }

    /// Read one complete R645 frame off the socket.
    pub async fn read_r645_frame(&mut self) -> Vec<u8> {
        let mut frame = self.read_exact(10).await;
        let payload_len = frame[9] as usize;
        frame.extend(self.read_exact(payload_len + 2).await);
        frame
    }

    /// Read one VW-wrapped packet, returning the payload (the APDU).
    pub async fn read_wrapped(&mut self) -> Vec<u8> {
        let header = self.read_exact(8).await;
        assert_eq!(&header[..4], &[0x00, 0x01, 0x00, 0x01], "wrapper signature");
        let len = u16::from_be_bytes([header[6], header[7]]) as usize;
        self.read_exact(len).await
    }

    /// Whether the gateway closed the socket (EOF within the timeout).
    pub async fn closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(timeout(RECV_TIMEOUT, self.stream.read(&mut buf)).await, Ok(Ok(0)))
    }
}

/// Wait for the next message on a subscription and decode its JSON.
pub async fn next_json(rx: &mut mpsc::Receiver<BusMessage>) -> (String, Value) {
    let message = timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("bus message timed out")
        .expect("subscription closed");
    let value = serde_json::from_slice(&message.payload).expect("bus payload is JSON");
    (message.topic, value)
}

/// Wait for a message on the subscription satisfying a predicate, skipping
/// others.
pub async fn next_json_matching(
    rx: &mut mpsc::Receiver<BusMessage>,
    mut predicate: impl FnMut(&str, &Value) -> bool,
) -> (String, Value) {
    loop {
        let (topic, value) = next_json(rx).await;
        if predicate(&topic, &value) {
            return (topic, value);
        }
    }
}

/// A voltage read-response frame from the given meter.
pub fn r645_voltage_response(address: &str, raw: &[u8]) -> Vec<u8> {
    use metergate_proto::r645::{ControlCode, Frame};
    let mut payload = 0x0201_0100u32.to_le_bytes().to_vec();
    payload.extend_from_slice(raw);
    Frame::new(address, ControlCode::READ.response(), payload).encode().expect("encode frame")
}

/// A 26-byte heartbeat packet wrapped in a VW header.
pub fn wrapped_heartbeat(meter_id: &str) -> Vec<u8> {
    let mut payload = vec![0x0A];
    payload.extend_from_slice(&[0x00; 10]);
    payload.extend_from_slice(meter_id.as_bytes());
    payload.push(0x2C);
    payload.extend_from_slice(&[0x0D, 0x0A]);
    metergate_proto::vw::wrap(metergate_proto::vw::DLMS_DESTINATION, &payload)
}

/// A minimal AARE, wrapped.
pub fn wrapped_aare(accepted: bool) -> Vec<u8> {
    let mut aare = vec![0x61, 0x10];
    aare.extend_from_slice(&[0xA1, 0x09, 0x06, 0x07, 0x60, 0x85, 0x74, 0x05, 0x08, 0x01, 0x01]);
    aare.extend_from_slice(&[0xA2, 0x03, 0x02, 0x01, u8::from(!accepted)]);
    metergate_proto::vw::wrap(metergate_proto::vw::DLMS_DESTINATION, &aare)
}
