//! Device-presence records broadcast on the device-info topic.

use serde::{Deserialize, Serialize};

/// Name of the broadcast topic, one per participant.
pub const DEVICE_INFO_TOPIC: &str = "realsense_device_info";

/// Registered type of the broadcast topic.
pub const DEVICE_INFO_TYPE: &str = "device-info";

/// Marketing prefix stripped from model names when building topic roots.
const DEVICE_NAME_PREFIX: &str = "Intel RealSense ";

/// The broadcast payload describing one attached device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable model name, e.g. "Intel RealSense D435".
    pub name: String,
    /// Unique key for the device.
    pub serial: String,
    #[serde(rename = "product-line")]
    pub product_line: String,
    pub locked: bool,
    /// Root of this device's topic tree. Always `topic_root(name, serial)`.
    #[serde(rename = "topic-root")]
    pub topic_root: String,
}

impl DeviceInfo {
    pub fn new(name: &str, serial: &str, product_line: &str, locked: bool) -> Self {
        Self {
            name: name.to_string(),
            serial: serial.to_string(),
            product_line: product_line.to_string(),
            locked,
            topic_root: topic_root(name, serial),
        }
    }
}

/// Build the device topic root from model name and serial.
///
/// The model-only name is used, e.g. `realsense/D435/11223344`. Names that do
/// not carry the marketing prefix pass through unchanged.
pub fn topic_root(name: &str, serial: &str) -> String {
    let model = name.strip_prefix(DEVICE_NAME_PREFIX).unwrap_or(name);
    format!("realsense/{}/{}", model, serial)
}
