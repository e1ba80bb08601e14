use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::{validate, ValidationError};

/// Event represents one timestamped state change reported by a device.
///
/// Events are produced upstream and never mutated here. Within a run they
/// arrive ordered by `timestamp` ascending.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireEvent", into = "WireEvent")]
pub struct Event {
    /// Device the event is about (e.g. "ITB-1101-D1")
    pub entity_id: String,

    /// Room containing the device (e.g. "ITB-1101")
    pub room_id: String,

    /// Building containing the room (e.g. "ITB")
    pub building_id: String,

    /// State field that changed ("power", "input", "blanked", ...)
    pub key: String,

    /// New value of the field
    pub value: String,

    /// Producer time
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event for a device, deriving room and building ids from the
    /// conventional `BLDG-ROOM-DEVICE` naming.
    pub fn for_device(
        entity_id: &str,
        key: &str,
        value: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut parts = entity_id.splitn(3, '-');
        let building = parts.next().unwrap_or_default();
        let room = parts.next().unwrap_or_default();
        let room_id = if room.is_empty() {
            String::new()
        } else {
            format!("{}-{}", building, room)
        };

        Self {
            entity_id: entity_id.to_string(),
            room_id,
            building_id: building.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            timestamp,
        }
    }

    /// Resolve the scope string this event belongs to.
    ///
    /// [`ScopeKey::Global`] maps every event to the empty scope.
    pub fn scope(&self, key: ScopeKey) -> &str {
        match key {
            ScopeKey::Device => &self.entity_id,
            ScopeKey::Room => &self.room_id,
            ScopeKey::Building => &self.building_id,
            ScopeKey::Global => "",
        }
    }
}

/// Field of an event used to segregate state machine instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKey {
    Device,
    Room,
    Building,
    Global,
}

impl ScopeKey {
    /// Parse a configured scope name. Unknown names resolve to a single
    /// global scope rather than an error.
    pub fn from_name(name: &str) -> Self {
        match name {
            "deviceid" => ScopeKey::Device,
            "roomid" => ScopeKey::Room,
            "buildingid" => ScopeKey::Building,
            _ => ScopeKey::Global,
        }
    }

    /// Name of the `target-device` field holding this scope's id.
    pub fn field(&self) -> &'static str {
        match self {
            ScopeKey::Device => "deviceID",
            ScopeKey::Room => "roomID",
            ScopeKey::Building => "buildingID",
            ScopeKey::Global => "",
        }
    }
}

/// Document layout used by the event store.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct WireEvent {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(rename = "target-device", default)]
    target_device: WireTarget,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WireTarget {
    #[serde(rename = "buildingID", default)]
    building_id: String,
    #[serde(rename = "roomID", default)]
    room_id: String,
    #[serde(rename = "deviceID", default)]
    device_id: String,
}

impl From<WireEvent> for Event {
    fn from(wire: WireEvent) -> Self {
        Self {
            entity_id: wire.target_device.device_id,
            room_id: wire.target_device.room_id,
            building_id: wire.target_device.building_id,
            key: wire.key,
            value: wire.value,
            timestamp: wire.timestamp,
        }
    }
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        Self {
            timestamp: event.timestamp,
            key: event.key,
            value: event.value,
            target_device: WireTarget {
                building_id: event.building_id,
                room_id: event.room_id,
                device_id: event.entity_id,
            },
        }
    }
}
