//! Numeric options exposed per stream.

use serde::{Deserialize, Serialize};

/// Valid range of a numeric option.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OptionRange {
    pub min: f32,
    pub max: f32,
    pub step: f32,
    #[serde(rename = "default")]
    pub default_value: f32,
}

/// One option as announced in a stream header. Option identity is the pair
/// (owner stream name, display name); the owning sensor is reached through
/// the stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OptionDescriptor {
    pub name: String,
    #[serde(rename = "owner-name")]
    pub owner_name: String,
    pub value: f32,
    pub range: OptionRange,
    #[serde(default)]
    pub description: String,
}

impl OptionDescriptor {
    /// Whether `value` lies within the declared range.
    pub fn accepts(&self, value: f32) -> bool {
        value >= self.range.min && value <= self.range.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure() -> OptionDescriptor {
        OptionDescriptor {
            name: "Exposure".to_string(),
            owner_name: "depth".to_string(),
            value: 8500.0,
            range: OptionRange {
                min: 1.0,
                max: 165000.0,
                step: 1.0,
                default_value: 8500.0,
            },
            description: "Controls exposure time of the sensor".to_string(),
        }
    }

    #[test]
    fn test_range_check() {
        let opt = exposure();
        assert!(opt.accepts(1.0));
        assert!(opt.accepts(165000.0));
        assert!(!opt.accepts(0.5));
        assert!(!opt.accepts(165001.0));
    }

    #[test]
    fn test_wire_field_names() {
        let value = serde_json::to_value(exposure()).unwrap();
        assert!(value.get("owner-name").is_some());
        assert!(value["range"].get("default").is_some());
    }
}
