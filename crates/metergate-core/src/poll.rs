//! Poll-plan resolution and per-meter cycle outcomes.
//!
//! The poller in the runtime crate drives the actual I/O; this module
//! resolves the configured register group into concrete read lists and
//! aggregates per-meter results into the poll-complete / poll-failed
//! events.

use metergate_proto::{
    obis::{self, ObisCategory, ObisDescriptor},
    registers::{self, RegisterDescriptor, RegisterSpace},
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::telemetry::TelemetryRecord;

/// Which registers a poll cycle reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterGroup {
    /// Cumulative energy registers only.
    Energy,
    /// Instantaneous registers only.
    Instantaneous,
    /// Energy plus instantaneous.
    All,
    /// Explicit list from `polling.custom_registers`.
    Custom,
}

/// Concrete read lists for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPlan {
    /// R645 registers, read sequentially per meter.
    pub r645: Vec<&'static RegisterDescriptor>,
    /// COSEM registers, read via invoke-id batched GETs.
    pub dlms: Vec<&'static ObisDescriptor>,
}

impl PollPlan {
    /// Whether the plan reads nothing.
    pub fn is_empty(&self) -> bool {
        self.r645.is_empty() && self.dlms.is_empty()
    }
}

/// Resolve the configured group (and custom names) into a plan.
///
/// Custom entries resolve case-insensitively against both descriptor
/// tables; names matching neither are skipped with a warning.
pub fn resolve_plan(group: RegisterGroup, custom: &[String]) -> PollPlan {
    match group {
        RegisterGroup::Energy => PollPlan {
            r645: registers::in_space(RegisterSpace::Energy).collect(),
            dlms: obis_in_categories(&[ObisCategory::Energy]),
        },
        RegisterGroup::Instantaneous => PollPlan {
            r645: registers::in_space(RegisterSpace::Instantaneous).collect(),
            dlms: obis_in_categories(&[
                ObisCategory::Power,
                ObisCategory::Voltage,
                ObisCategory::Current,
                ObisCategory::Frequency,
            ]),
        },
        RegisterGroup::All => PollPlan {
            r645: registers::in_space(RegisterSpace::Energy)
                .chain(registers::in_space(RegisterSpace::Instantaneous))
                .collect(),
            dlms: obis_in_categories(&[
                ObisCategory::Energy,
                ObisCategory::Power,
                ObisCategory::Voltage,
                ObisCategory::Current,
                ObisCategory::Frequency,
            ]),
        },
        RegisterGroup::Custom => {
            let mut plan = PollPlan { r645: Vec::new(), dlms: Vec::new() };
            for name in custom {
                if let Some(descriptor) = registers::by_key(name) {
                    plan.r645.push(descriptor);
                } else if let Some(descriptor) = obis::by_key(name) {
                    plan.dlms.push(descriptor);
                } else {
                    tracing::warn!(register = %name, "unknown register in custom poll set");
                }
            }
            plan
        },
    }
}

fn obis_in_categories(categories: &[ObisCategory]) -> Vec<&'static ObisDescriptor> {
    obis::OBIS_REGISTRY
        .iter()
        .filter(|d| categories.contains(&d.category))
        .collect()
}

/// Result of polling one meter.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterPollOutcome {
    /// Meter identity.
    pub meter_id: String,
    /// Successful readings.
    pub readings: Vec<TelemetryRecord>,
    /// Per-register failures: (register key, error message).
    pub errors: Vec<(String, String)>,
}

impl MeterPollOutcome {
    /// Start an empty outcome for a meter.
    pub fn new(meter_id: impl Into<String>) -> Self {
        Self { meter_id: meter_id.into(), readings: Vec::new(), errors: Vec::new() }
    }

    /// A cycle fails when more than half of the attempted registers
    /// errored. An empty register set is a success.
    pub fn is_failed(&self) -> bool {
        let attempted = self.readings.len() + self.errors.len();
        self.errors.len() * 2 > attempted
    }

    /// Event name: `poll-complete` or `poll-failed`.
    pub fn event_name(&self) -> &'static str {
        if self.is_failed() { "poll-failed" } else { "poll-complete" }
    }

    /// Event data payload.
    pub fn event_data(&self) -> Value {
        json!({
            "metersPolled": 1,
            "successful": u32::from(!self.is_failed()),
            "readings": self.readings.iter().map(|r| json!({
                "register": r.key,
                "value": r.scaled,
            })).collect::<Vec<_>>(),
            "errors": self.errors.iter().map(|(key, error)| json!({
                "register": key,
                "error": error,
            })).collect::<Vec<_>>(),
        })
    }
}
