use crate::error::Error;
use crate::state::ValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-display scratch state: the tracked values and when each was last set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayState {
    #[serde(default)]
    pub power: Option<String>,
    #[serde(default)]
    pub power_set: Option<DateTime<Utc>>,

    #[serde(default)]
    pub blanked: Option<bool>,
    #[serde(default)]
    pub blank_set: Option<DateTime<Utc>>,

    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub input_set: Option<DateTime<Utc>>,

    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub volume_set: Option<DateTime<Utc>>,

    #[serde(default)]
    pub muted: Option<bool>,
    #[serde(default)]
    pub mute_set: Option<DateTime<Utc>>,
}

impl ValueStore for DisplayState {
    fn slot(&self, name: &str) -> Option<String> {
        match name {
            "power" => self.power.clone(),
            "blanked" => self.blanked.map(|b| b.to_string()),
            "input" => self.input.clone(),
            "volume" => self.volume.map(|v| v.to_string()),
            "muted" => self.muted.map(|m| m.to_string()),
            _ => None,
        }
    }
}

/// Read a "set at" timestamp a callback depends on.
pub(crate) fn require(value: Option<DateTime<Utc>>, field: &str) -> Result<DateTime<Utc>, Error> {
    value.ok_or_else(|| Error::InvalidState(format!("{} is not set", field)))
}
