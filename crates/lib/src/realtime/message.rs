//! Realtime feed message types and frame decoding.
//!
//! Every text frame is a JSON object `{ "type": "<discriminator>", "payload": { ... } }`.
//! The discriminator selects one of six payload shapes; everything else about the
//! feed is undocumented, so all payload fields are optional and unknown fields are ignored.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::reporter::DecodeReporter;
use crate::wire::null_default;

/// One decoded frame from the realtime feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    MonitorInfo(MonitorInfo),
    DeviceStates(DeviceStates),
    RealtimeUpdate(RealtimeUpdate),
    DataChange(DataChange),
    NewTimelineEvent(NewTimelineEvent),
}

impl Message {
    /// Wire discriminator of this message (e.g. `"realtime_update"`).
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::MonitorInfo(_) => "monitor_info",
            Message::DeviceStates(_) => "device_states",
            Message::RealtimeUpdate(_) => "realtime_update",
            Message::DataChange(_) => "data_change",
            Message::NewTimelineEvent(_) => "new_timeline_event",
        }
    }
}

/// First message after connecting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hello {
    #[serde(deserialize_with = "null_default")]
    pub online: bool,
}

/// Monitor capabilities, sent as a single CSV string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorInfo {
    #[serde(deserialize_with = "null_default")]
    pub features: String,
}

impl MonitorInfo {
    /// Individual feature flags (e.g. `SOLAR`, `DEVICE_DELETION`).
    pub fn feature_list(&self) -> Vec<&str> {
        self.features
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Online state of every known device; sent shortly after connecting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceStates {
    #[serde(deserialize_with = "null_default")]
    pub states: Vec<DeviceState>,
    #[serde(deserialize_with = "null_default")]
    pub update_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceState {
    #[serde(deserialize_with = "null_default")]
    pub device_id: String,
    #[serde(deserialize_with = "null_default")]
    pub mode: String,
    #[serde(deserialize_with = "null_default")]
    pub state: String,
}

/// Periodic (about once a second) snapshot of the monitor and all known devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeUpdate {
    #[serde(deserialize_with = "null_default")]
    pub c: i64,
    /// Wattage per monitor sensor.
    #[serde(deserialize_with = "null_default")]
    pub channels: Vec<f64>,
    /// Same as `w`, as an integer.
    #[serde(deserialize_with = "null_default")]
    pub d_w: i64,
    #[serde(rename = "defaultCost", alias = "default_cost", deserialize_with = "null_default")]
    pub default_cost: f64,
    /// Usually empty; when present, the change in W since the previous update.
    #[serde(deserialize_with = "null_default")]
    pub deltas: Vec<Delta>,
    #[serde(deserialize_with = "null_default")]
    pub devices: Vec<Device>,
    /// Unix time of the start of the stream.
    #[serde(deserialize_with = "null_default")]
    pub epoch: i64,
    /// Counter increasing between updates (about 30 per update).
    #[serde(deserialize_with = "null_default")]
    pub frame: i64,
    #[serde(deserialize_with = "null_default")]
    pub grid_w: f64,
    /// AC frequency in Hz.
    #[serde(deserialize_with = "null_default")]
    pub hz: f64,
    #[serde(deserialize_with = "null_default")]
    pub power_flow: PowerFlow,
    /// AC voltage per monitor sensor.
    #[serde(deserialize_with = "null_default")]
    pub voltage: Vec<f64>,
    /// Total wattage currently being consumed.
    #[serde(deserialize_with = "null_default")]
    pub w: f64,
    #[serde(rename = "_stats", deserialize_with = "null_default")]
    pub stats: Stats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerFlow {
    #[serde(deserialize_with = "null_default")]
    pub grid: Vec<String>,
}

/// Server-side receive/send timestamps (Unix seconds, sub-second precision).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    #[serde(deserialize_with = "null_default")]
    pub brcv: f64,
    #[serde(deserialize_with = "null_default")]
    pub mrcv: f64,
    #[serde(deserialize_with = "null_default")]
    pub msnd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delta {
    #[serde(deserialize_with = "null_default")]
    pub frame: i64,
    #[serde(deserialize_with = "null_default")]
    pub channel: i64,
    #[serde(deserialize_with = "null_default")]
    pub start_frame: i64,
    #[serde(deserialize_with = "null_default")]
    pub w: f64,
}

/// Current consumption of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    #[serde(deserialize_with = "null_default")]
    pub id: String,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub icon: String,
    #[serde(deserialize_with = "null_default")]
    pub w: f64,
    pub location: Option<String>,
    pub make: Option<String>,
    pub attrs: serde_json::Value,
    #[serde(deserialize_with = "null_default")]
    pub tags: HashMap<String, serde_json::Value>,
}

/// Signals that some server-side data changed and clients may want to refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChange {
    #[serde(deserialize_with = "null_default")]
    pub device_data_checksum: String,
    #[serde(deserialize_with = "null_default")]
    pub monitor_overview_checksum: String,
    #[serde(deserialize_with = "null_default")]
    pub partner_checksum: String,
    #[serde(deserialize_with = "null_default")]
    pub pending_events: PendingEvents,
    #[serde(deserialize_with = "null_default")]
    pub settings_version: i64,
    #[serde(deserialize_with = "null_default")]
    pub user_version: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingEvents {
    #[serde(rename = "type", deserialize_with = "null_default")]
    pub kind: String,
    pub monitor_id: Option<i64>,
    #[serde(deserialize_with = "null_default")]
    pub goal: GoalEvent,
    #[serde(deserialize_with = "null_default")]
    pub new_device_found: NewDeviceFound,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalEvent {
    #[serde(deserialize_with = "null_default")]
    pub guid: String,
    pub notification_id: serde_json::Value,
    pub timestamp: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewDeviceFound {
    pub device_id: serde_json::Value,
    #[serde(deserialize_with = "null_default")]
    pub guid: String,
    pub timestamp: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTimelineEvent {
    #[serde(deserialize_with = "null_default")]
    pub items_added: Vec<TimelineEvent>,
    #[serde(deserialize_with = "null_default")]
    pub items_removed: Vec<TimelineEvent>,
    #[serde(deserialize_with = "null_default")]
    pub items_updated: Vec<TimelineEvent>,
    #[serde(deserialize_with = "null_default")]
    pub user_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineEvent {
    #[serde(deserialize_with = "null_default")]
    pub allow_sticky: bool,
    #[serde(deserialize_with = "null_default")]
    pub body: String,
    #[serde(deserialize_with = "null_default")]
    pub body_args: Vec<serde_json::Value>,
    #[serde(deserialize_with = "null_default")]
    pub body_key: String,
    #[serde(deserialize_with = "null_default")]
    pub destination: String,
    #[serde(deserialize_with = "null_default")]
    pub device_id: String,
    #[serde(deserialize_with = "null_default")]
    pub device_state: String,
    #[serde(deserialize_with = "null_default")]
    pub device_transition_from_state: String,
    #[serde(deserialize_with = "null_default")]
    pub guid: String,
    #[serde(deserialize_with = "null_default")]
    pub icon: String,
    #[serde(deserialize_with = "null_default")]
    pub monitor_id: i64,
    #[serde(deserialize_with = "null_default")]
    pub show_action: bool,
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "type", deserialize_with = "null_default")]
    pub kind: String,
    #[serde(deserialize_with = "null_default")]
    pub user_device_type: String,
}

/// Why a frame could not be turned into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unable to parse message type: {0}")]
    Discriminator(#[source] serde_json::Error),

    #[error("unknown message type: {0:?}")]
    UnknownType(String),

    #[error("unable to parse {kind} message: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Key used to suppress repeated reports: the discriminator, or `""` when none could be read.
    pub fn report_key(&self) -> &str {
        match self {
            DecodeError::Discriminator(_) => "",
            DecodeError::UnknownType(t) => t,
            DecodeError::Payload { kind, .. } => kind,
        }
    }
}

#[derive(Deserialize)]
struct Discriminator {
    #[serde(rename = "type", default, deserialize_with = "null_default")]
    typ: String,
}

#[derive(Deserialize)]
struct Envelope<P> {
    #[serde(default)]
    payload: Option<P>,
}

fn payload<P: DeserializeOwned + Default>(
    kind: &'static str,
    buf: &[u8],
) -> Result<P, DecodeError> {
    serde_json::from_slice::<Envelope<P>>(buf)
        .map(|e| e.payload.unwrap_or_default())
        .map_err(|source| DecodeError::Payload { kind, source })
}

/// Parse one raw frame. Pure: no logging; see [`Decoder`] for the reporting wrapper.
pub fn parse_message(buf: &[u8]) -> Result<Message, DecodeError> {
    let disc: Discriminator = serde_json::from_slice(buf).map_err(DecodeError::Discriminator)?;
    let msg = match disc.typ.as_str() {
        "hello" => Message::Hello(payload("hello", buf)?),
        "monitor_info" => Message::MonitorInfo(payload("monitor_info", buf)?),
        "device_states" => Message::DeviceStates(payload("device_states", buf)?),
        "realtime_update" => Message::RealtimeUpdate(payload("realtime_update", buf)?),
        "data_change" => Message::DataChange(payload("data_change", buf)?),
        "new_timeline_event" => Message::NewTimelineEvent(payload("new_timeline_event", buf)?),
        _ => return Err(DecodeError::UnknownType(disc.typ)),
    };
    Ok(msg)
}

/// Frame decoder owned by one streaming session. Failures are logged once per discriminator.
#[derive(Debug, Default)]
pub struct Decoder {
    reporter: DecodeReporter,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, buf: &[u8]) -> Result<Message, DecodeError> {
        parse_message(buf).inspect_err(|e| {
            self.reporter.report(e, buf);
        })
    }

    pub fn reporter(&self) -> &DecodeReporter {
        &self.reporter
    }
}
