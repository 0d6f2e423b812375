//! Spatial relation between streams of one device.

use serde::{Deserialize, Serialize};

/// Rotation (row-major 3x3) and translation (meters) from one stream's frame
/// of reference to another's.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Extrinsics {
    pub rotation: [f32; 9],
    pub translation: [f32; 3],
}

impl Extrinsics {
    pub fn identity() -> Self {
        Self {
            rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            translation: [0.0, 0.0, 0.0],
        }
    }
}

/// One entry of the device extrinsics table: `from` and `to` are stream
/// names; every ordered pair of distinct streams gets an entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExtrinsicsEntry {
    pub from: String,
    pub to: String,
    #[serde(flatten)]
    pub extrinsics: Extrinsics,
}
