//! Gateway configuration.
//!
//! Loaded from an optional JSON file; every option has a default so a
//! missing file means a fully-default gateway. CLI flags override the
//! listen port and log level only.

use std::{path::Path, time::Duration};

use metergate_core::poll::RegisterGroup;
use serde::Deserialize;

use crate::error::GatewayError;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GatewayConfig {
    /// TCP listen port for meters.
    pub listen_port: u16,
    /// Concurrent connection cap.
    pub max_connections: usize,
    /// Expected heartbeat cadence in milliseconds; idle threshold is twice
    /// this.
    pub heartbeat_interval_ms: u64,
    /// Inactivity ceiling in milliseconds before a forced close.
    pub connection_timeout_ms: u64,
    /// Command timeout in milliseconds.
    pub command_timeout_ms: u64,
    /// Bus topic prefix.
    pub topic_prefix: String,
    /// Polling options.
    pub polling: PollingConfig,
    /// DLMS options.
    pub dlms: DlmsConfig,
    /// Heartbeat handling options.
    pub heartbeat: HeartbeatConfig,
    /// R645 relay credentials.
    pub r645: R645Config,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: 8899,
            max_connections: 1000,
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 300_000,
            command_timeout_ms: 10_000,
            topic_prefix: "metergate".to_string(),
            polling: PollingConfig::default(),
            dlms: DlmsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            r645: R645Config::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| GatewayError::Config(format!("bad config {}: {e}", path.display())))
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Connection timeout as a [`Duration`].
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Poller options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PollingConfig {
    /// Whether periodic polling runs at all.
    pub enabled: bool,
    /// Cycle interval in milliseconds.
    pub interval_ms: u64,
    /// Which registers each cycle reads.
    pub register_group: RegisterGroup,
    /// Explicit register list for the `custom` group.
    pub custom_registers: Vec<String>,
    /// Per-read timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retries per register.
    pub retries: u32,
    /// Delay between meters within one cycle, in milliseconds.
    pub stagger_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 60_000,
            register_group: RegisterGroup::Energy,
            custom_registers: Vec::new(),
            timeout_ms: 5_000,
            retries: 2,
            stagger_ms: 100,
        }
    }
}

/// DLMS stack options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DlmsConfig {
    /// Whether the DLMS side is enabled at all.
    pub enabled: bool,
    /// Skip active polling and rely on unsolicited notifications.
    pub passive_only: bool,
    /// AARE wait in milliseconds.
    pub association_timeout_ms: u64,
    /// Per-GET wait in milliseconds.
    pub query_timeout_ms: u64,
    /// Whether outbound APDUs get the VW wrapper.
    pub wrap_outgoing: bool,
    /// Destination wPort for outbound wrapped APDUs.
    pub ivy_destination: u16,
    /// Run one association/read cycle immediately on identify.
    pub auto_associate: bool,
}

impl Default for DlmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            passive_only: true,
            association_timeout_ms: 5_000,
            query_timeout_ms: 5_000,
            wrap_outgoing: true,
            ivy_destination: 0x0001,
            auto_associate: false,
        }
    }
}

/// What to do with the all-zero factory identity in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroAddressAction {
    /// Register the meter under `000000000000` as announced.
    Accept,
    /// Substitute the remote IP address as the identity.
    UseIp,
}

/// Heartbeat handling options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Whether heartbeats are acknowledged.
    pub ack_enabled: bool,
    /// Hex-encoded ack payload written raw to the socket.
    pub ack_payload_hex: String,
    /// Policy for the all-zero identity.
    pub zero_address_action: ZeroAddressAction,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ack_enabled: false,
            ack_payload_hex: String::new(),
            zero_address_action: ZeroAddressAction::Accept,
        }
    }
}

impl HeartbeatConfig {
    /// Decode the configured ack payload.
    pub fn ack_payload(&self) -> Result<Vec<u8>, GatewayError> {
        parse_hex(&self.ack_payload_hex)
            .map_err(|e| GatewayError::Config(format!("heartbeat.ack_payload_hex: {e}")))
    }
}

/// R645 relay command credentials.
///
/// When an AES key is configured, relay commands use the authenticated
/// frame; otherwise the simple frame is sent and timeouts are tolerated.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct R645Config {
    /// 16-byte AES-128 key, hex encoded. Empty disables authentication.
    pub relay_aes_key_hex: String,
    /// 4-byte operator code, hex encoded.
    pub operator_hex: String,
    /// 4-byte password, hex encoded.
    pub password_hex: String,
}

impl Default for R645Config {
    fn default() -> Self {
        Self {
            relay_aes_key_hex: String::new(),
            operator_hex: "00000000".to_string(),
            password_hex: "00000000".to_string(),
        }
    }
}

impl R645Config {
    /// Decoded AES key, `None` when authentication is disabled.
    pub fn relay_aes_key(&self) -> Result<Option<[u8; 16]>, metergate_core::error::CommandError> {
        if self.relay_aes_key_hex.is_empty() {
            return Ok(None);
        }
        let bytes = parse_hex(&self.relay_aes_key_hex)
            .map_err(metergate_core::error::CommandError::Invalid)?;
        let key: [u8; 16] = bytes.try_into().map_err(|_| {
            metergate_core::error::CommandError::Invalid(
                "relay_aes_key_hex must be 16 bytes".to_string(),
            )
        })?;
        Ok(Some(key))
    }

    /// Decoded operator code.
    pub fn operator(&self) -> Result<[u8; 4], metergate_core::error::CommandError> {
        fixed4(&self.operator_hex, "operator_hex")
    }

    /// Decoded password.
    pub fn password(&self) -> Result<[u8; 4], metergate_core::error::CommandError> {
        fixed4(&self.password_hex, "password_hex")
    }
}

fn fixed4(text: &str, field: &str) -> Result<[u8; 4], metergate_core::error::CommandError> {
    let bytes = parse_hex(text).map_err(metergate_core::error::CommandError::Invalid)?;
    bytes.try_into().map_err(|_| {
        metergate_core::error::CommandError::Invalid(format!("{field} must be 4 bytes"))
    })
}

/// Decode a hex string (whitespace tolerated).
pub fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&compact[i..i + 2], 16)
                .map_err(|_| format!("bad hex pair {:?}", &compact[i..i + 2]))
        })
        .collect()
}
