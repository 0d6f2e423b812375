//! Streams, profiles and profile compatibility.

use super::options::OptionDescriptor;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every stream kind a device can expose.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Depth,
    Color,
    Ir,
    Fisheye,
    Confidence,
    Accel,
    Gyro,
    Pose,
}

impl StreamKind {
    /// Video kinds carry resolution; motion kinds do not.
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            StreamKind::Depth
                | StreamKind::Color
                | StreamKind::Ir
                | StreamKind::Fisheye
                | StreamKind::Confidence
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Depth => "depth",
            StreamKind::Color => "color",
            StreamKind::Ir => "ir",
            StreamKind::Fisheye => "fisheye",
            StreamKind::Confidence => "confidence",
            StreamKind::Accel => "accel",
            StreamKind::Gyro => "gyro",
            StreamKind::Pose => "pose",
        }
    }

    /// Stream name for this kind plus an optional index suffix,
    /// e.g. `ir_1`, `ir_2` for the two infrared imagers.
    pub fn stream_name(&self, index: u8) -> String {
        if index == 0 {
            self.as_str().to_string()
        } else {
            format!("{}_{}", self.as_str(), index)
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way a video stream can be produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VideoProfile {
    #[serde(rename = "w")]
    pub width: u16,
    #[serde(rename = "h")]
    pub height: u16,
    pub fps: u16,
    /// `None` acts as a wildcard when matching against declared profiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// One way a motion stream can be produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MotionProfile {
    pub fps: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Kind-specific stream profile. Video precedes motion so that untagged
/// decoding picks the variant with resolution fields when they are present.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Profile {
    Video(VideoProfile),
    Motion(MotionProfile),
}

impl Profile {
    pub fn video(width: u16, height: u16, fps: u16, format: &str) -> Self {
        Profile::Video(VideoProfile {
            width,
            height,
            fps,
            format: Some(format.to_string()),
        })
    }

    pub fn motion(fps: u16, format: &str) -> Self {
        Profile::Motion(MotionProfile {
            fps,
            format: Some(format.to_string()),
        })
    }

    pub fn fps(&self) -> u16 {
        match self {
            Profile::Video(v) => v.fps,
            Profile::Motion(m) => m.fps,
        }
    }

    pub fn format(&self) -> Option<&str> {
        match self {
            Profile::Video(v) => v.format.as_deref(),
            Profile::Motion(m) => m.format.as_deref(),
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Profile::Video(_))
    }

    /// Whether `self`, as a request, can be satisfied by the declared
    /// profile `other`: kind and fps must match, resolution must match for
    /// video, and format must match unless the request wildcards it.
    pub fn is_compatible(&self, other: &Profile) -> bool {
        match (self, other) {
            (Profile::Video(a), Profile::Video(b)) => {
                if a.width != b.width || a.height != b.height {
                    return false;
                }
            }
            (Profile::Motion(_), Profile::Motion(_)) => {}
            _ => return false,
        }
        if let Some(format) = self.format()
            && Some(format) != other.format()
        {
            return false;
        }
        self.fps() == other.fps()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Video(v) => write!(
                f,
                "{}x{} @{}fps {}",
                v.width,
                v.height,
                v.fps,
                v.format.as_deref().unwrap_or("*")
            ),
            Profile::Motion(m) => {
                write!(f, "@{}fps {}", m.fps, m.format.as_deref().unwrap_or("*"))
            }
        }
    }
}

/// Pinhole camera model for a video stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VideoIntrinsics {
    pub width: u16,
    pub height: u16,
    pub ppx: f32,
    pub ppy: f32,
    pub fx: f32,
    pub fy: f32,
    pub model: String,
    pub coeffs: [f32; 5],
}

/// Scale/bias/variance model for a motion stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MotionIntrinsics {
    pub data: [f32; 12],
    #[serde(rename = "noise-variances")]
    pub noise_variances: [f32; 3],
    #[serde(rename = "bias-variances")]
    pub bias_variances: [f32; 3],
}

/// Full description of one stream: what the server announces and what the
/// client mirrors after the handshake.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Stream {
    pub name: String,
    pub kind: StreamKind,
    pub sensor_name: String,
    pub profiles: Vec<Profile>,
    pub default_profile_index: usize,
    #[serde(default)]
    pub options: Vec<OptionDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intrinsics: Option<VideoIntrinsics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_intrinsics: Option<MotionIntrinsics>,
}

impl Stream {
    /// Validate internal consistency: a usable default index and profiles
    /// whose shape matches the stream kind.
    pub fn validate(&self) -> Result<()> {
        if self.default_profile_index >= self.profiles.len() {
            return Err(Error::Protocol(format!(
                "stream '{}' default profile index {} is out of bounds",
                self.name, self.default_profile_index
            )));
        }
        for profile in &self.profiles {
            if profile.is_video() != self.kind.is_video() {
                return Err(Error::Protocol(format!(
                    "stream '{}' has a {} profile but is of type '{}'",
                    self.name,
                    if profile.is_video() { "video" } else { "motion" },
                    self.kind
                )));
            }
        }
        Ok(())
    }

    pub fn default_profile(&self) -> &Profile {
        &self.profiles[self.default_profile_index]
    }

    /// First declared profile the request is compatible with.
    pub fn find_profile(&self, request: &Profile) -> Option<&Profile> {
        self.profiles.iter().find(|p| request.is_compatible(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name_with_index() {
        assert_eq!(StreamKind::Ir.stream_name(0), "ir");
        assert_eq!(StreamKind::Ir.stream_name(1), "ir_1");
        assert_eq!(StreamKind::Ir.stream_name(2), "ir_2");
        assert_eq!(StreamKind::Depth.stream_name(0), "depth");
    }

    #[test]
    fn test_video_compatibility() {
        let declared = Profile::video(640, 480, 30, "Z16");
        assert!(Profile::video(640, 480, 30, "Z16").is_compatible(&declared));
        assert!(!Profile::video(1280, 720, 30, "Z16").is_compatible(&declared));
        assert!(!Profile::video(640, 480, 60, "Z16").is_compatible(&declared));
        assert!(!Profile::video(640, 480, 30, "Y8").is_compatible(&declared));
        // Motion never matches video.
        assert!(!Profile::motion(30, "Z16").is_compatible(&declared));
    }

    #[test]
    fn test_wildcard_format_matches_any() {
        let declared = Profile::video(640, 480, 30, "Z16");
        let request = Profile::Video(VideoProfile {
            width: 640,
            height: 480,
            fps: 30,
            format: None,
        });
        assert!(request.is_compatible(&declared));
    }

    #[test]
    fn test_motion_compatibility() {
        let declared = Profile::motion(200, "MOTION_XYZ32F");
        assert!(Profile::motion(200, "MOTION_XYZ32F").is_compatible(&declared));
        assert!(!Profile::motion(400, "MOTION_XYZ32F").is_compatible(&declared));
    }

    #[test]
    fn test_untagged_profile_decoding() {
        let video: Profile =
            serde_json::from_str(r#"{"w":640,"h":480,"fps":30,"format":"Z16"}"#).unwrap();
        assert!(video.is_video());

        let motion: Profile = serde_json::from_str(r#"{"fps":200,"format":"XYZ32F"}"#).unwrap();
        assert!(!motion.is_video());
    }

    #[test]
    fn test_stream_validation() {
        let mut stream = Stream {
            name: "depth".to_string(),
            kind: StreamKind::Depth,
            sensor_name: "Stereo Module".to_string(),
            profiles: vec![Profile::video(640, 480, 30, "Z16")],
            default_profile_index: 0,
            options: Vec::new(),
            intrinsics: None,
            motion_intrinsics: None,
        };
        assert!(stream.validate().is_ok());

        stream.default_profile_index = 1;
        assert!(stream.validate().is_err());

        stream.default_profile_index = 0;
        stream.profiles.push(Profile::motion(200, "XYZ32F"));
        assert!(stream.validate().is_err());
    }
}
