//! JSON documents exchanged with the hub.
//!
//! Commands are partial: every field is optional and an absent field keeps
//! the previous value. State and discovery documents are complete and their
//! key order is part of the wire contract.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    config::DeviceMetadata,
    error::CodecError,
    identity::DeviceIdentity,
    topics::TopicSet,
    types::{LightState, CHANNEL_MAX},
};

const STATE_ON: &str = "ON";
const STATE_OFF: &str = "OFF";

#[derive(Debug, Default, Deserialize)]
struct CommandDocument {
    #[serde(default, deserialize_with = "switch_field")]
    state: Option<bool>,
    #[serde(default, deserialize_with = "color_field")]
    color: Option<ColorPatch>,
    #[serde(default, deserialize_with = "level_field")]
    brightness: Option<u16>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ColorPatch {
    r: Option<u16>,
    g: Option<u16>,
    b: Option<u16>,
    w: Option<u16>,
}

// Only the exact string "ON" switches the light on; any other string is OFF
// and a non-string value leaves the flag untouched.
fn switch_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) => Some(value == STATE_ON),
        _ => None,
    })
}

fn level_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    Ok(level_from(&Value::deserialize(deserializer)?))
}

fn color_field<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<ColorPatch>, D::Error> {
    let Value::Object(members) = Value::deserialize(deserializer)? else {
        return Ok(None);
    };

    let channel = |key: &str| members.get(key).and_then(level_from);
    Ok(Some(ColorPatch {
        r: channel("r"),
        g: channel("g"),
        b: channel("b"),
        w: channel("w"),
    }))
}

/// Truncates any JSON number to an integer and clamps it into the channel
/// range. Non-numbers count as absent.
fn level_from(value: &Value) -> Option<u16> {
    let Value::Number(number) = value else {
        return None;
    };

    let level = if let Some(signed) = number.as_i64() {
        signed.clamp(0, i64::from(CHANNEL_MAX))
    } else if number.as_u64().is_some() {
        i64::from(CHANNEL_MAX)
    } else {
        let float = number.as_f64()?.trunc();
        float.clamp(0.0, f64::from(CHANNEL_MAX)) as i64
    };

    u16::try_from(level).ok()
}

/// Applies a partial-update command on top of `previous`.
pub fn decode_command(payload: &[u8], previous: &LightState) -> Result<LightState, CodecError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|err| CodecError::InvalidPayload(err.to_string()))?;
    if !value.is_object() {
        return Err(CodecError::InvalidPayload(
            "top-level value is not an object".to_string(),
        ));
    }
    let command: CommandDocument = serde_json::from_value(value)
        .map_err(|err| CodecError::InvalidPayload(err.to_string()))?;

    let mut next = *previous;
    if let Some(is_on) = command.state {
        next.is_on = is_on;
    }
    if let Some(color) = command.color {
        next.r = color.r.unwrap_or(next.r);
        next.g = color.g.unwrap_or(next.g);
        next.b = color.b.unwrap_or(next.b);
        next.w = color.w.unwrap_or(next.w);
    }
    if let Some(brightness) = command.brightness {
        next.brightness = brightness;
    }
    Ok(next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColorDocument {
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub w: u16,
}

/// Full state as published on the state topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateDocument {
    pub state: &'static str,
    pub brightness: u16,
    pub color: ColorDocument,
}

impl From<&LightState> for StateDocument {
    fn from(state: &LightState) -> Self {
        Self {
            state: if state.is_on { STATE_ON } else { STATE_OFF },
            brightness: state.brightness,
            color: ColorDocument {
                r: state.r,
                g: state.g,
                b: state.b,
                w: state.w,
            },
        }
    }
}

pub fn encode_state(state: &LightState) -> Vec<u8> {
    serde_json::to_vec(&StateDocument::from(state)).expect("state document is always serializable")
}

#[derive(Debug, Serialize)]
struct DiscoveryDevice<'a> {
    ids: [&'a str; 1],
    name: &'a str,
    mf: &'a str,
    mdl: &'a str,
    sw: &'a str,
    sn: u32,
}

/// Home Assistant MQTT light discovery (JSON schema).
#[derive(Debug, Serialize)]
pub struct DiscoveryDocument<'a> {
    name: &'a str,
    command_topic: &'a str,
    state_topic: &'a str,
    unique_id: &'a str,
    platform: &'static str,
    device: DiscoveryDevice<'a>,
    schema: &'static str,
    brightness: bool,
    brightness_scale: u16,
    supported_color_modes: [&'static str; 1],
}

impl<'a> DiscoveryDocument<'a> {
    pub fn new(
        identity: &'a DeviceIdentity,
        topics: &'a TopicSet,
        metadata: &'a DeviceMetadata,
    ) -> Self {
        Self {
            name: &metadata.name,
            command_topic: &topics.command,
            state_topic: &topics.state,
            unique_id: &topics.unique_id,
            platform: "mqtt",
            device: DiscoveryDevice {
                ids: [identity.as_str()],
                name: &metadata.device_name,
                mf: &metadata.manufacturer,
                mdl: &metadata.model,
                sw: &metadata.sw_version,
                sn: metadata.serial_number,
            },
            schema: "json",
            brightness: true,
            brightness_scale: CHANNEL_MAX,
            supported_color_modes: ["rgbw"],
        }
    }
}

pub fn encode_discovery(
    identity: &DeviceIdentity,
    topics: &TopicSet,
    metadata: &DeviceMetadata,
) -> Vec<u8> {
    serde_json::to_vec(&DiscoveryDocument::new(identity, topics, metadata))
        .expect("discovery document is always serializable")
}
