//! Message bus surface.
//!
//! The bus itself is an external collaborator; the gateway only needs a
//! publish/subscribe contract and the topic scheme. [`InMemoryBus`] backs
//! tests and the standalone binary; a broker adapter implements the same
//! trait out of tree.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// One message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Full topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Publish/subscribe contract the gateway depends on.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload; `retain` marks last-value topics.
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool);

    /// Subscribe to a topic filter (`+` single-level and `#` multi-level
    /// wildcards).
    async fn subscribe(&self, filter: &str) -> mpsc::Receiver<BusMessage>;
}

/// Topic scheme builder.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    /// Build with the configured prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Per-meter telemetry topic.
    pub fn telemetry(&self, meter_id: &str) -> String {
        format!("{}/v1/meters/{meter_id}/telemetry", self.prefix)
    }

    /// Per-meter retained status topic.
    pub fn status(&self, meter_id: &str) -> String {
        format!("{}/v1/meters/{meter_id}/status", self.prefix)
    }

    /// Per-meter event topic.
    pub fn events(&self, meter_id: &str) -> String {
        format!("{}/v1/meters/{meter_id}/events", self.prefix)
    }

    /// Per-meter command response topic.
    pub fn command_response(&self, meter_id: &str) -> String {
        format!("{}/v1/meters/{meter_id}/command/response", self.prefix)
    }

    /// Subscription filter for command requests across all meters.
    pub fn command_request_filter(&self) -> String {
        format!("{}/v1/meters/+/command/request", self.prefix)
    }

    /// Retained gateway status topic.
    pub fn gateway_status(&self) -> String {
        format!("{}/gateway/status", self.prefix)
    }

    /// Gateway-level event topic (no meter context).
    pub fn gateway_events(&self) -> String {
        format!("{}/gateway/events", self.prefix)
    }

    /// Extract the meter id from a command request topic.
    pub fn meter_from_request_topic(&self, topic: &str) -> Option<String> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix("/v1/meters/")?;
        let meter = rest.strip_suffix("/command/request")?;
        if meter.is_empty() || meter.contains('/') {
            return None;
        }
        Some(meter.to_string())
    }
}

/// Whether `topic` matches an MQTT-style `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {},
            (Some(f), Some(t)) if f == t => {},
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscriber {
    filter: String,
    sender: mpsc::Sender<BusMessage>,
}

/// In-process bus for tests and the standalone binary.
///
/// Retained messages are replayed to late subscribers, matching broker
/// behavior for status topics.
#[derive(Default)]
pub struct InMemoryBus {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    subscribers: Vec<Subscriber>,
    retained: Vec<BusMessage>,
}

impl InMemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) {
        let message = BusMessage { topic: topic.to_string(), payload };
        let mut state = self.state.lock().await;

        if retain {
            state.retained.retain(|m| m.topic != topic);
            state.retained.push(message.clone());
        }

        state.subscribers.retain(|s| !s.sender.is_closed());
        for subscriber in &state.subscribers {
            if topic_matches(&subscriber.filter, topic) {
                // A slow subscriber drops messages rather than blocking the
                // gateway.
                let _ = subscriber.sender.try_send(message.clone());
            }
        }
    }

    async fn subscribe(&self, filter: &str) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.state.lock().await;

        for message in &state.retained {
            if topic_matches(filter, &message.topic) {
                let _ = tx.try_send(message.clone());
            }
        }

        state.subscribers.push(Subscriber { filter: filter.to_string(), sender: tx });
        rx
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn every_topic_matches_itself_and_hash(
            parts in proptest::collection::vec("[a-z0-9]{1,8}", 1..6)
        ) {
            let topic = parts.join("/");
            prop_assert!(topic_matches(&topic, &topic));
            prop_assert!(topic_matches("#", &topic));
        }
    }

    #[test]
    fn topic_matching() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/d"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/c/d"));
        assert!(topic_matches("a/#", "a/b/c/d"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/b", "a"));
    }

    #[test]
    fn topic_scheme() {
        let topics = Topics::new("metergate");
        assert_eq!(
            topics.telemetry("000000001234"),
            "metergate/v1/meters/000000001234/telemetry"
        );
        assert_eq!(topics.gateway_status(), "metergate/gateway/status");
        assert_eq!(
            topics.command_request_filter(),
            "metergate/v1/meters/+/command/request"
        );
        assert_eq!(
            topics.meter_from_request_topic("metergate/v1/meters/000000001234/command/request"),
            Some("000000001234".to_string())
        );
        assert_eq!(
            topics.meter_from_request_topic("metergate/v1/meters/x/y/command/request"),
            None
        );
        assert_eq!(topics.meter_from_request_topic("other/v1/meters/x/command/request"), None);
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let bus = InMemoryBus::new();
        let mut telemetry = bus.subscribe("m/v1/meters/+/telemetry").await;
        let mut everything = bus.subscribe("#").await;

        bus.publish("m/v1/meters/1/telemetry", b"x".to_vec(), false).await;
        bus.publish("m/v1/meters/1/status", b"y".to_vec(), false).await;

        let got = telemetry.recv().await.unwrap();
        assert_eq!(got.topic, "m/v1/meters/1/telemetry");

        assert_eq!(everything.recv().await.unwrap().payload, b"x".to_vec());
        assert_eq!(everything.recv().await.unwrap().payload, b"y".to_vec());
    }

    #[tokio::test]
    async fn retained_replayed_to_late_subscriber() {
        let bus = InMemoryBus::new();
        bus.publish("m/gateway/status", b"online".to_vec(), true).await;
        bus.publish("m/gateway/status", b"online2".to_vec(), true).await;

        let mut sub = bus.subscribe("m/gateway/status").await;
        // Only the latest retained value is kept.
        assert_eq!(sub.recv().await.unwrap().payload, b"online2".to_vec());
        assert!(sub.try_recv().is_err());
    }
}
