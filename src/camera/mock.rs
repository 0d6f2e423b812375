//! Mock camera for tests and hardware-free operation.
//!
//! Behaves like the real SDK surface: sensors enforce the
//! open/start/stop/close lifecycle, options are range-checked, and injected
//! frames reach the registered callback only while the owning sensor is
//! streaming. Tests can read back every lifecycle transition and force the
//! next start to fail.

use super::{Camera, Frame, FrameCallback, SdkProfile};
use crate::bridge::ProfileBinding;
use crate::device::extrinsics::Extrinsics;
use crate::device::options::{OptionDescriptor, OptionRange};
use crate::device::stream::{MotionIntrinsics, StreamKind, VideoIntrinsics};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// One recorded lifecycle call, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraTransition {
    Open(String, Vec<String>),
    Start(String),
    Stop(String),
    Close(String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open,
    Streaming,
}

struct MockSensor {
    profiles: Vec<SdkProfile>,
    options: BTreeMap<String, (f32, OptionRange, String)>,
    phase: Phase,
    open_streams: Vec<String>,
    callback: Option<FrameCallback>,
    fail_next_start: bool,
}

impl MockSensor {
    fn new() -> Self {
        Self {
            profiles: Vec::new(),
            options: BTreeMap::new(),
            phase: Phase::Closed,
            open_streams: Vec::new(),
            callback: None,
            fail_next_start: false,
        }
    }
}

pub struct MockCamera {
    name: String,
    serial: String,
    product_line: String,
    locked: bool,
    metadata: bool,
    sensors: Mutex<BTreeMap<String, MockSensor>>,
    transitions: Mutex<Vec<CameraTransition>>,
}

impl MockCamera {
    pub fn new(name: &str, serial: &str, product_line: &str) -> Self {
        Self {
            name: name.to_string(),
            serial: serial.to_string(),
            product_line: product_line.to_string(),
            locked: false,
            metadata: true,
            sensors: Mutex::new(BTreeMap::new()),
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Stereo + RGB camera: depth, two infrared imagers and color.
    pub fn d435(serial: &str) -> Self {
        let camera = Self::new("Intel RealSense D435", serial, "D400");
        camera.add_video_profiles(
            "Stereo Module",
            StreamKind::Depth,
            0,
            &[
                (640, 480, 30, "Z16", true),
                (640, 480, 60, "Z16", false),
                (1280, 720, 30, "Z16", false),
            ],
        );
        camera.add_video_profiles(
            "Stereo Module",
            StreamKind::Ir,
            1,
            &[(640, 480, 30, "Y8", true), (1280, 720, 30, "Y8", false)],
        );
        camera.add_video_profiles(
            "Stereo Module",
            StreamKind::Ir,
            2,
            &[(640, 480, 30, "Y8", true), (1280, 720, 30, "Y8", false)],
        );
        camera.add_video_profiles(
            "RGB Camera",
            StreamKind::Color,
            0,
            &[
                (640, 480, 30, "RGB8", true),
                (1920, 1080, 30, "RGB8", false),
            ],
        );
        camera.add_option(
            "Stereo Module",
            "Exposure",
            8500.0,
            (1.0, 165000.0, 1.0, 8500.0),
            "Controls exposure time of the sensor",
        );
        camera.add_option(
            "Stereo Module",
            "Laser Power",
            150.0,
            (0.0, 360.0, 30.0, 150.0),
            "Manual laser power in mw",
        );
        camera.add_option(
            "RGB Camera",
            "White Balance",
            4600.0,
            (2800.0, 6500.0, 10.0, 4600.0),
            "Controls white balance of color image",
        );
        camera
    }

    /// D435 layout plus a motion module with accel and gyro.
    pub fn d455(serial: &str) -> Self {
        let mut camera = Self::d435(serial);
        camera.name = "Intel RealSense D455".to_string();
        camera.add_motion_profiles(
            "Motion Module",
            StreamKind::Accel,
            &[(63, "MOTION_XYZ32F", true), (250, "MOTION_XYZ32F", false)],
        );
        camera.add_motion_profiles(
            "Motion Module",
            StreamKind::Gyro,
            &[(200, "MOTION_XYZ32F", true), (400, "MOTION_XYZ32F", false)],
        );
        camera
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.metadata = enabled;
        self
    }

    pub fn add_video_profiles(
        &self,
        sensor: &str,
        kind: StreamKind,
        index: u8,
        profiles: &[(u16, u16, u16, &str, bool)],
    ) {
        let mut sensors = self.sensors.lock();
        let entry = sensors.entry(sensor.to_string()).or_insert_with(MockSensor::new);
        for &(width, height, fps, format, is_default) in profiles {
            entry.profiles.push(SdkProfile {
                kind,
                index,
                width,
                height,
                fps,
                format: format.to_string(),
                is_default,
            });
        }
    }

    pub fn add_motion_profiles(
        &self,
        sensor: &str,
        kind: StreamKind,
        profiles: &[(u16, &str, bool)],
    ) {
        let mut sensors = self.sensors.lock();
        let entry = sensors.entry(sensor.to_string()).or_insert_with(MockSensor::new);
        for &(fps, format, is_default) in profiles {
            entry.profiles.push(SdkProfile {
                kind,
                index: 0,
                width: 0,
                height: 0,
                fps,
                format: format.to_string(),
                is_default,
            });
        }
    }

    pub fn add_option(
        &self,
        sensor: &str,
        name: &str,
        value: f32,
        (min, max, step, default_value): (f32, f32, f32, f32),
        description: &str,
    ) {
        let mut sensors = self.sensors.lock();
        let entry = sensors.entry(sensor.to_string()).or_insert_with(MockSensor::new);
        entry.options.insert(
            name.to_string(),
            (
                value,
                OptionRange {
                    min,
                    max,
                    step,
                    default_value,
                },
                description.to_string(),
            ),
        );
    }

    /// Make the next `start` on `sensor` fail, as a misbehaving camera would.
    pub fn fail_next_start(&self, sensor: &str) {
        if let Some(entry) = self.sensors.lock().get_mut(sensor) {
            entry.fail_next_start = true;
        }
    }

    /// Deliver a frame as if produced by the hardware. Returns `false` when
    /// no streaming sensor owns the frame's stream.
    pub fn inject_frame(&self, frame: Frame) -> bool {
        let callback = {
            let sensors = self.sensors.lock();
            sensors.values().find_map(|s| {
                (s.phase == Phase::Streaming
                    && s.open_streams.iter().any(|n| *n == frame.stream_name))
                .then(|| s.callback.clone())
                .flatten()
            })
        };
        match callback {
            Some(callback) => {
                callback(frame);
                true
            }
            None => false,
        }
    }

    /// Lifecycle calls recorded so far, oldest first.
    pub fn transitions(&self) -> Vec<CameraTransition> {
        self.transitions.lock().clone()
    }
}

impl Camera for MockCamera {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn serial(&self) -> String {
        self.serial.clone()
    }

    fn product_line(&self) -> String {
        self.product_line.clone()
    }

    fn locked(&self) -> bool {
        self.locked
    }

    fn supports_metadata(&self) -> bool {
        self.metadata
    }

    fn sensors(&self) -> Vec<String> {
        self.sensors.lock().keys().cloned().collect()
    }

    fn sensor_profiles(&self, sensor: &str) -> Result<Vec<SdkProfile>> {
        self.sensors
            .lock()
            .get(sensor)
            .map(|s| s.profiles.clone())
            .ok_or_else(|| Error::NotFound(format!("no sensor '{}'", sensor)))
    }

    fn sensor_options(&self, sensor: &str) -> Result<Vec<OptionDescriptor>> {
        let sensors = self.sensors.lock();
        let entry = sensors
            .get(sensor)
            .ok_or_else(|| Error::NotFound(format!("no sensor '{}'", sensor)))?;
        Ok(entry
            .options
            .iter()
            .map(|(name, (value, range, description))| OptionDescriptor {
                name: name.clone(),
                owner_name: String::new(),
                value: *value,
                range: range.clone(),
                description: description.clone(),
            })
            .collect())
    }

    fn video_intrinsics(&self, stream_name: &str) -> Option<VideoIntrinsics> {
        let sensors = self.sensors.lock();
        let profile = sensors
            .values()
            .flat_map(|s| s.profiles.iter())
            .find(|p| p.kind.is_video() && p.stream_name() == stream_name)?;
        Some(VideoIntrinsics {
            width: profile.width,
            height: profile.height,
            ppx: profile.width as f32 / 2.0,
            ppy: profile.height as f32 / 2.0,
            fx: profile.width as f32 * 0.9,
            fy: profile.width as f32 * 0.9,
            model: "brown_conrady".to_string(),
            coeffs: [0.0; 5],
        })
    }

    fn motion_intrinsics(&self, stream_name: &str) -> Option<MotionIntrinsics> {
        let sensors = self.sensors.lock();
        sensors
            .values()
            .flat_map(|s| s.profiles.iter())
            .find(|p| !p.kind.is_video() && p.stream_name() == stream_name)?;
        Some(MotionIntrinsics {
            data: [
                1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0,
            ],
            noise_variances: [0.0; 3],
            bias_variances: [0.0; 3],
        })
    }

    fn extrinsics(&self, from_stream: &str, to_stream: &str) -> Option<Extrinsics> {
        if from_stream == to_stream {
            return None;
        }
        Some(Extrinsics::identity())
    }

    fn open(&self, sensor: &str, profiles: &[ProfileBinding]) -> Result<()> {
        let mut sensors = self.sensors.lock();
        let entry = sensors
            .get_mut(sensor)
            .ok_or_else(|| Error::NotFound(format!("no sensor '{}'", sensor)))?;
        if entry.phase != Phase::Closed {
            return Err(Error::Conflict(format!(
                "sensor '{}' is already open",
                sensor
            )));
        }
        entry.phase = Phase::Open;
        entry.open_streams = profiles.iter().map(|b| b.stream_name.clone()).collect();
        self.transitions.lock().push(CameraTransition::Open(
            sensor.to_string(),
            entry.open_streams.clone(),
        ));
        Ok(())
    }

    fn start(&self, sensor: &str, callback: FrameCallback) -> Result<()> {
        let mut sensors = self.sensors.lock();
        let entry = sensors
            .get_mut(sensor)
            .ok_or_else(|| Error::NotFound(format!("no sensor '{}'", sensor)))?;
        if entry.phase != Phase::Open {
            return Err(Error::Conflict(format!("sensor '{}' is not open", sensor)));
        }
        if entry.fail_next_start {
            entry.fail_next_start = false;
            return Err(Error::Internal(format!(
                "sensor '{}' failed to start",
                sensor
            )));
        }
        entry.phase = Phase::Streaming;
        entry.callback = Some(callback);
        self.transitions
            .lock()
            .push(CameraTransition::Start(sensor.to_string()));
        Ok(())
    }

    fn stop(&self, sensor: &str) -> Result<()> {
        let mut sensors = self.sensors.lock();
        let entry = sensors
            .get_mut(sensor)
            .ok_or_else(|| Error::NotFound(format!("no sensor '{}'", sensor)))?;
        if entry.phase != Phase::Streaming {
            return Err(Error::Conflict(format!(
                "sensor '{}' is not streaming",
                sensor
            )));
        }
        entry.phase = Phase::Open;
        entry.callback = None;
        self.transitions
            .lock()
            .push(CameraTransition::Stop(sensor.to_string()));
        Ok(())
    }

    fn close(&self, sensor: &str) -> Result<()> {
        let mut sensors = self.sensors.lock();
        let entry = sensors
            .get_mut(sensor)
            .ok_or_else(|| Error::NotFound(format!("no sensor '{}'", sensor)))?;
        if entry.phase != Phase::Open {
            return Err(Error::Conflict(format!("sensor '{}' is not open", sensor)));
        }
        entry.phase = Phase::Closed;
        entry.open_streams.clear();
        self.transitions
            .lock()
            .push(CameraTransition::Close(sensor.to_string()));
        Ok(())
    }

    fn set_option(&self, sensor: &str, option: &str, value: f32) -> Result<()> {
        let mut sensors = self.sensors.lock();
        let entry = sensors
            .get_mut(sensor)
            .ok_or_else(|| Error::NotFound(format!("no sensor '{}'", sensor)))?;
        let (current, range, _) = entry
            .options
            .get_mut(option)
            .ok_or_else(|| Error::NotFound(format!("no option '{}'", option)))?;
        if value < range.min || value > range.max {
            return Err(Error::BadRequest(format!(
                "value {} out of range [{}, {}] for option '{}'",
                value, range.min, range.max, option
            )));
        }
        *current = value;
        Ok(())
    }

    fn get_option(&self, sensor: &str, option: &str) -> Result<f32> {
        let sensors = self.sensors.lock();
        let entry = sensors
            .get(sensor)
            .ok_or_else(|| Error::NotFound(format!("no sensor '{}'", sensor)))?;
        entry
            .options
            .get(option)
            .map(|(value, _, _)| *value)
            .ok_or_else(|| Error::NotFound(format!("no option '{}'", option)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn depth_binding() -> ProfileBinding {
        ProfileBinding {
            stream_name: "depth".to_string(),
            sensor_name: "Stereo Module".to_string(),
            profile: crate::device::stream::Profile::video(640, 480, 30, "Z16"),
        }
    }

    fn depth_frame(number: u64) -> Frame {
        Frame {
            stream_name: "depth".to_string(),
            frame_number: number,
            timestamp: number as f64 * 33.3,
            timestamp_domain: "system-time".to_string(),
            depth_units: Some(0.001),
            data: vec![0u8; 16],
            metadata: vec![("Actual FPS".to_string(), 30)],
        }
    }

    #[test]
    fn test_lifecycle_enforced() {
        let camera = MockCamera::d435("0001");
        let cb: FrameCallback = Arc::new(|_| {});

        // start before open is a conflict
        assert!(camera.start("Stereo Module", Arc::clone(&cb)).is_err());

        camera.open("Stereo Module", &[depth_binding()]).unwrap();
        camera.start("Stereo Module", cb).unwrap();
        assert!(camera.open("Stereo Module", &[depth_binding()]).is_err());
        camera.stop("Stereo Module").unwrap();
        camera.close("Stereo Module").unwrap();

        assert_eq!(
            camera.transitions(),
            vec![
                CameraTransition::Open("Stereo Module".to_string(), vec!["depth".to_string()]),
                CameraTransition::Start("Stereo Module".to_string()),
                CameraTransition::Stop("Stereo Module".to_string()),
                CameraTransition::Close("Stereo Module".to_string()),
            ]
        );
    }

    #[test]
    fn test_frames_only_reach_streaming_sensor() {
        let camera = MockCamera::d435("0001");
        let delivered = Arc::new(AtomicUsize::new(0));

        assert!(!camera.inject_frame(depth_frame(1)));

        camera.open("Stereo Module", &[depth_binding()]).unwrap();
        let count = Arc::clone(&delivered);
        camera
            .start(
                "Stereo Module",
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        assert!(camera.inject_frame(depth_frame(2)));
        // Streams the sensor was not opened with do not deliver.
        let mut color = depth_frame(3);
        color.stream_name = "color".to_string();
        assert!(!camera.inject_frame(color));

        assert_eq!(delivered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_option_range_enforced() {
        let camera = MockCamera::d435("0001");
        camera
            .set_option("Stereo Module", "Laser Power", 300.0)
            .unwrap();
        assert_eq!(
            camera.get_option("Stereo Module", "Laser Power").unwrap(),
            300.0
        );
        assert!(
            camera
                .set_option("Stereo Module", "Laser Power", 500.0)
                .is_err()
        );
    }

    #[test]
    fn test_injected_start_failure() {
        let camera = MockCamera::d435("0001");
        camera.fail_next_start("Stereo Module");
        camera.open("Stereo Module", &[depth_binding()]).unwrap();
        assert!(camera.start("Stereo Module", Arc::new(|_| {})).is_err());
        // The failure is one-shot.
        assert!(camera.start("Stereo Module", Arc::new(|_| {})).is_ok());
    }
}
