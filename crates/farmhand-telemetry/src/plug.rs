//! Smart plug data types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized relay state of a plug.
///
/// Firmwares report state as `1`/`0`, `true`/`false`, `on`/`off` and
/// friends; anything unrecognized is kept verbatim, uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlugState {
    /// The plug reports its relay closed.
    On,
    /// The plug reports its relay open.
    Off,
    /// Any other reported state, uppercased.
    Other(String),
}

impl PlugState {
    /// Normalizes a raw state string.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "1" | "TRUE" | "ON" => PlugState::On,
            "0" | "FALSE" | "OFF" => PlugState::Off,
            other => PlugState::Other(other.to_string()),
        }
    }

    /// Canonical text form: `ON`, `OFF`, or the uppercased raw state.
    pub fn as_str(&self) -> &str {
        match self {
            PlugState::On => "ON",
            PlugState::Off => "OFF",
            PlugState::Other(raw) => raw,
        }
    }
}

impl fmt::Display for PlugState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where to find a plug's readings inside its topic payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlugSubscription {
    /// MQTT topic the plug publishes telemetry on.
    pub topic: String,
    /// Dot path to the instantaneous power reading.
    pub power_path: Option<String>,
    /// Dot path to the cumulative energy reading.
    pub energy_path: Option<String>,
    /// Dot path to the relay state.
    pub state_path: Option<String>,
    /// Scale applied to numeric readings, for firmwares that report
    /// deciwatts and similar.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl PlugSubscription {
    /// Subscription for `topic` with no paths and a multiplier of 1.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            power_path: None,
            energy_path: None,
            state_path: None,
            multiplier: default_multiplier(),
        }
    }

    /// Sets the power path.
    pub fn with_power_path(mut self, path: impl Into<String>) -> Self {
        self.power_path = Some(path.into());
        self
    }

    /// Sets the energy path.
    pub fn with_energy_path(mut self, path: impl Into<String>) -> Self {
        self.energy_path = Some(path.into());
        self
    }

    /// Sets the state path.
    pub fn with_state_path(mut self, path: impl Into<String>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Sets the numeric multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }
}

fn default_multiplier() -> f64 {
    1.0
}

/// Latest readings for one plug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlugSnapshot {
    /// Device id the readings belong to.
    pub plug_id: i64,
    /// Most recent power reading, if one has been extracted.
    pub power: Option<f64>,
    /// Most recent energy reading, if one has been extracted.
    pub energy: Option<f64>,
    /// Most recent relay state, if one has been extracted.
    pub state: Option<PlugState>,
    /// When telemetry (or the subscription itself) last touched this plug.
    pub last_seen: DateTime<Utc>,
}

impl PlugSnapshot {
    /// Empty snapshot for a plug that was just subscribed.
    pub fn new(plug_id: i64) -> Self {
        Self {
            plug_id,
            power: None,
            energy: None,
            state: None,
            last_seen: Utc::now(),
        }
    }
}
