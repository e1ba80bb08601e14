use crate::event::Event;
use crate::metrics::enrich::Enricher;
use crate::metrics::record::MetricsRecord;
use crate::metrics::store::{require, DisplayState};
use crate::state::{Action, ActionRef, Failure, Outcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

/// Callbacks of the display-state graph
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayStep {
    /// Display came on: restart every timer
    PowerOnStore,
    /// Remember a newly selected input
    InputStore,
    /// Close the time spent on the current input
    InputRecord,
    /// Close the time spent unblanked, leaving the timer running
    UnblankedRecord,
    /// Close the unblanked time and start blank tracking
    EnterBlank,
    /// Close the blanked time and restart input tracking
    BlankedRecord,
    /// Close the powered-on time (plus volume and mute) on standby
    StandbyEnter,
    /// Close the standby time on power on
    StandbyExit,
    /// Close the previous volume level and track the new one
    VolumeChange,
    /// Close the previous mute state and track the new one
    MuteChange,
    /// Track the volume level without timing it
    VolumeStore,
    /// Track the mute state without timing it
    MuteStore,
}

impl DisplayStep {
    pub fn label(&self) -> &'static str {
        match self {
            DisplayStep::PowerOnStore => "power-on-store",
            DisplayStep::InputStore => "input-store",
            DisplayStep::InputRecord => "input-record",
            DisplayStep::UnblankedRecord => "unblanked-record",
            DisplayStep::EnterBlank => "enter-blank",
            DisplayStep::BlankedRecord => "blanked-record",
            DisplayStep::StandbyEnter => "standby-enter",
            DisplayStep::StandbyExit => "standby-exit",
            DisplayStep::VolumeChange => "volume-change",
            DisplayStep::MuteChange => "mute-change",
            DisplayStep::VolumeStore => "volume-store",
            DisplayStep::MuteStore => "mute-store",
        }
    }
}

/// One display callback bound to the record enricher.
pub struct DisplayAction {
    step: DisplayStep,
    enricher: Arc<Enricher>,
}

impl DisplayAction {
    pub fn new(step: DisplayStep, enricher: Arc<Enricher>) -> Self {
        Self { step, enricher }
    }

    pub fn shared(step: DisplayStep, enricher: &Arc<Enricher>) -> ActionRef<DisplayState, MetricsRecord> {
        Arc::new(Self::new(step, Arc::clone(enricher)))
    }

    /// Enrich every pending record, collecting partial output on failure.
    async fn close(
        &self,
        pending: Vec<(MetricsRecord, DateTime<Utc>)>,
        event: &Event,
    ) -> Outcome<MetricsRecord> {
        let mut records = Vec::new();
        let mut first_error = None;

        for (record, start) in pending {
            match self.enricher.finish(record, start, event).await {
                Ok(mut finished) => records.append(&mut finished),
                Err(failure) => {
                    records.extend(failure.records);
                    first_error.get_or_insert(failure.error);
                }
            }
        }

        match first_error {
            Some(error) => Err(Failure::with_records(records, error)),
            None => Ok(records),
        }
    }
}

#[async_trait]
impl Action<DisplayState, MetricsRecord> for DisplayAction {
    fn label(&self) -> String {
        self.step.label().to_string()
    }

    async fn execute(&self, state: &mut DisplayState, event: &Event) -> Outcome<MetricsRecord> {
        let ts = event.timestamp;

        let pending = match self.step {
            DisplayStep::PowerOnStore => {
                if event.key == "power" {
                    state.power = Some("on".to_string());
                    state.power_set = Some(ts);
                    state.blanked = Some(false);
                    state.blank_set = Some(ts);
                    state.input_set = Some(ts);
                    state.volume_set = state.volume.map(|_| ts);
                    state.mute_set = state.muted.map(|_| ts);
                }
                Vec::new()
            }

            DisplayStep::InputStore => {
                let changed = state.input.as_deref() != Some(event.value.as_str());
                if event.key == "input" && !event.value.is_empty() && changed {
                    state.input = Some(event.value.clone());
                    state.input_set = Some(ts);
                }
                Vec::new()
            }

            DisplayStep::InputRecord => {
                let Some(current) = state.input.clone() else {
                    warn!(entity = %event.entity_id, "Cannot create input record with input state not set");
                    return Ok(Vec::new());
                };
                if current == event.value {
                    return Ok(Vec::new());
                }
                let start = require(state.input_set, "input-set")?;
                vec![(MetricsRecord::input(&current), start)]
            }

            DisplayStep::UnblankedRecord => {
                let start = require(state.blank_set, "blank-set")?;
                vec![(MetricsRecord::blank(false), start)]
            }

            DisplayStep::EnterBlank => {
                if event.key != "blanked" {
                    return Ok(Vec::new());
                }
                let start = require(state.blank_set, "blank-set")?;
                state.blank_set = Some(ts);
                state.blanked = Some(true);
                vec![(MetricsRecord::blank(false), start)]
            }

            DisplayStep::BlankedRecord => {
                let start = require(state.blank_set, "blank-set")?;
                state.blanked = Some(false);
                state.input_set = Some(ts);
                state.blank_set = Some(ts);
                vec![(MetricsRecord::blank(true), start)]
            }

            DisplayStep::StandbyEnter => {
                let start = require(state.power_set, "power-set")?;
                state.power = Some("standby".to_string());
                state.power_set = Some(ts);

                let mut pending = vec![(MetricsRecord::power("on"), start)];
                if let (Some(level), Some(set)) = (state.volume, state.volume_set.take()) {
                    pending.push((MetricsRecord::volume(level), set));
                }
                if let (Some(muted), Some(set)) = (state.muted, state.mute_set.take()) {
                    pending.push((MetricsRecord::mute(muted), set));
                }
                pending
            }

            DisplayStep::StandbyExit => {
                let start = require(state.power_set, "power-set")?;
                state.power = Some("on".to_string());
                state.power_set = Some(ts);
                vec![(MetricsRecord::power("standby"), start)]
            }

            DisplayStep::VolumeChange => {
                let Some(level) = parse_volume(event) else {
                    return Ok(Vec::new());
                };
                if state.volume == Some(level) {
                    return Ok(Vec::new());
                }

                let pending = match (state.volume, state.volume_set) {
                    (Some(previous), Some(set)) => vec![(MetricsRecord::volume(previous), set)],
                    _ => Vec::new(),
                };
                state.volume = Some(level);
                state.volume_set = Some(ts);
                pending
            }

            DisplayStep::MuteChange => {
                let Some(muted) = parse_muted(event) else {
                    return Ok(Vec::new());
                };
                if state.muted == Some(muted) {
                    return Ok(Vec::new());
                }

                let pending = match (state.muted, state.mute_set) {
                    (Some(previous), Some(set)) => vec![(MetricsRecord::mute(previous), set)],
                    _ => Vec::new(),
                };
                state.muted = Some(muted);
                state.mute_set = Some(ts);
                pending
            }

            DisplayStep::VolumeStore => {
                if let Some(level) = parse_volume(event) {
                    state.volume = Some(level);
                }
                Vec::new()
            }

            DisplayStep::MuteStore => {
                if let Some(muted) = parse_muted(event) {
                    state.muted = Some(muted);
                }
                Vec::new()
            }
        };

        if pending.is_empty() {
            return Ok(Vec::new());
        }
        self.close(pending, event).await
    }
}

fn parse_volume(event: &Event) -> Option<i64> {
    let parsed = event
        .value
        .parse::<i64>()
        .ok()
        .or_else(|| event.value.parse::<f64>().ok().map(|v| v.round() as i64));

    if parsed.is_none() {
        warn!(entity = %event.entity_id, value = %event.value, "Ignoring unparseable volume");
    }
    parsed
}

fn parse_muted(event: &Event) -> Option<bool> {
    match event.value.as_str() {
        "true" => Some(true),
        "false" => Some(false),
        other => {
            warn!(entity = %event.entity_id, value = %other, "Ignoring unparseable mute state");
            None
        }
    }
}
