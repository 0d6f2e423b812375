//! Self-describing records carried on the notification and control topics.
//!
//! Every record is a JSON dictionary keyed by `"id"`. The same record set is
//! registered on both per-device topics; direction decides which ids are
//! meaningful where (headers and errors flow server to client, requests flow
//! client to server, and `query-option` flows both ways).

use super::extrinsics::ExtrinsicsEntry;
use super::options::OptionDescriptor;
use super::stream::{MotionIntrinsics, Profile, StreamKind, VideoIntrinsics};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Registered type of the notification and control topics.
pub const FLEXIBLE_TYPE: &str = "flexible";

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "id")]
pub enum DeviceMessage {
    /// First record of the handshake; announces how many stream headers
    /// follow and the device-level extrinsics table.
    #[serde(rename = "device-header")]
    DeviceHeader {
        #[serde(rename = "n-streams")]
        n_streams: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        extrinsics: Vec<ExtrinsicsEntry>,
    },

    /// One per stream, in any order after the device header.
    #[serde(rename = "stream-header")]
    StreamHeader {
        name: String,
        #[serde(rename = "type")]
        kind: StreamKind,
        #[serde(rename = "sensor-name")]
        sensor_name: String,
        #[serde(rename = "default-profile-index")]
        default_profile_index: usize,
        profiles: Vec<Profile>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<OptionDescriptor>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intrinsics: Option<VideoIntrinsics>,
        #[serde(
            rename = "motion-intrinsics",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        motion_intrinsics: Option<MotionIntrinsics>,
    },

    /// Declare which streams should be active, one profile per stream.
    #[serde(rename = "open-streams")]
    OpenStreams {
        #[serde(rename = "stream-profiles")]
        stream_profiles: BTreeMap<String, Profile>,
        #[serde(default = "default_true")]
        reset: bool,
        #[serde(default = "default_true")]
        commit: bool,
    },

    #[serde(rename = "close-streams")]
    CloseStreams {
        #[serde(rename = "stream-names")]
        stream_names: Vec<String>,
    },

    #[serde(rename = "set-option")]
    SetOption {
        #[serde(rename = "option-name")]
        option_name: String,
        #[serde(rename = "owner-name")]
        owner_name: String,
        value: f32,
    },

    /// Request (no `value`) and reply (`value` filled in by the server).
    #[serde(rename = "query-option")]
    QueryOption {
        #[serde(rename = "option-name")]
        option_name: String,
        #[serde(rename = "owner-name")]
        owner_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<f32>,
    },

    #[serde(rename = "error")]
    Error { error: String },
}

impl DeviceMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<DeviceMessage> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The record id, as it appears on the wire.
    pub fn id(&self) -> &'static str {
        match self {
            DeviceMessage::DeviceHeader { .. } => "device-header",
            DeviceMessage::StreamHeader { .. } => "stream-header",
            DeviceMessage::OpenStreams { .. } => "open-streams",
            DeviceMessage::CloseStreams { .. } => "close-streams",
            DeviceMessage::SetOption { .. } => "set-option",
            DeviceMessage::QueryOption { .. } => "query-option",
            DeviceMessage::Error { .. } => "error",
        }
    }
}

/// Per-frame header published alongside the frame payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetadataHeader {
    #[serde(rename = "frame-id")]
    pub frame_id: String,
    pub timestamp: f64,
    #[serde(rename = "timestamp-domain")]
    pub timestamp_domain: String,
    /// Present only for depth frames.
    #[serde(rename = "depth-units", default, skip_serializing_if = "Option::is_none")]
    pub depth_units: Option<f32>,
}

/// Record published on `<topic-root>/metadata` for every frame when metadata
/// is enabled for the device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    #[serde(rename = "stream-name")]
    pub stream_name: String,
    pub header: MetadataHeader,
    /// Every supported metadata key with its value.
    pub metadata: BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_header_wire_format() {
        let msg = DeviceMessage::DeviceHeader {
            n_streams: 2,
            extrinsics: Vec::new(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], "device-header");
        assert_eq!(value["n-streams"], 2);
    }

    #[test]
    fn test_open_streams_defaults() {
        // reset and commit default to true when absent from the record.
        let msg = DeviceMessage::decode(
            br#"{"id":"open-streams","stream-profiles":{"depth":{"w":640,"h":480,"fps":30,"format":"Z16"}}}"#,
        )
        .unwrap();
        match msg {
            DeviceMessage::OpenStreams {
                stream_profiles,
                reset,
                commit,
            } => {
                assert!(reset);
                assert!(commit);
                assert!(stream_profiles.contains_key("depth"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_stream_header_round_trip() {
        let msg = DeviceMessage::StreamHeader {
            name: "ir_1".to_string(),
            kind: StreamKind::Ir,
            sensor_name: "Stereo Module".to_string(),
            default_profile_index: 0,
            profiles: vec![Profile::video(1280, 720, 30, "Y8")],
            options: Vec::new(),
            intrinsics: None,
            motion_intrinsics: None,
        };
        let decoded = DeviceMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.id(), "stream-header");
    }

    #[test]
    fn test_unknown_stream_type_fails_decode() {
        let result = DeviceMessage::decode(
            br#"{"id":"stream-header","name":"x","type":"thermal","sensor-name":"s","default-profile-index":0,"profiles":[]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_query_option_reply_carries_value() {
        let request = DeviceMessage::QueryOption {
            option_name: "Exposure".to_string(),
            owner_name: "depth".to_string(),
            value: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("value").is_none());

        let reply = DeviceMessage::decode(
            br#"{"id":"query-option","option-name":"Exposure","owner-name":"depth","value":8500.0}"#,
        )
        .unwrap();
        match reply {
            DeviceMessage::QueryOption { value, .. } => assert_eq!(value, Some(8500.0)),
            other => panic!("unexpected message {:?}", other),
        }
    }
}
