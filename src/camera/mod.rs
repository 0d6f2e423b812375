//! Camera SDK facade.
//!
//! The bridge core never talks to camera hardware directly; it consumes this
//! interface. A production build would back it with the vendor SDK; the
//! in-tree [`mock`] implementation backs tests and the sample server.
//!
//! Threading contract: `start` hands the sensor a frame callback that will be
//! invoked on an SDK-owned thread. The callback must not block; it may only
//! hand the frame off (the device server pushes it onto a lock-free queue and
//! wakes its dispatcher).

pub mod mock;

use crate::bridge::ProfileBinding;
use crate::device::extrinsics::Extrinsics;
use crate::device::options::OptionDescriptor;
use crate::device::stream::{MotionIntrinsics, Profile, StreamKind, VideoIntrinsics};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One raw sensor profile as enumerated by the SDK, before profiles are
/// grouped into streams.
#[derive(Debug, Clone, PartialEq)]
pub struct SdkProfile {
    pub kind: StreamKind,
    /// Distinguishes multiple streams of the same kind on one sensor
    /// (`ir_1`, `ir_2`). Zero means unindexed.
    pub index: u8,
    pub width: u16,
    pub height: u16,
    pub fps: u16,
    pub format: String,
    pub is_default: bool,
}

impl SdkProfile {
    pub fn stream_name(&self) -> String {
        self.kind.stream_name(self.index)
    }

    pub fn to_profile(&self) -> Profile {
        if self.kind.is_video() {
            Profile::video(self.width, self.height, self.fps, &self.format)
        } else {
            Profile::motion(self.fps, &self.format)
        }
    }
}

/// One frame delivered by a streaming sensor.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_name: String,
    pub frame_number: u64,
    pub timestamp: f64,
    pub timestamp_domain: String,
    /// Present only on depth frames.
    pub depth_units: Option<f32>,
    pub data: Vec<u8>,
    /// Supported metadata keys with their values.
    pub metadata: Vec<(String, i64)>,
}

pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// A physical camera as the bridge sees it.
///
/// Sensor state transitions must follow open -> start -> stop -> close; the
/// implementation reports `Conflict` otherwise.
pub trait Camera: Send + Sync {
    fn name(&self) -> String;
    fn serial(&self) -> String;
    fn product_line(&self) -> String;
    fn locked(&self) -> bool;

    /// Whether this model supports per-frame metadata.
    fn supports_metadata(&self) -> bool;

    /// Sensor names, stable across calls.
    fn sensors(&self) -> Vec<String>;

    /// Every profile the sensor can produce.
    fn sensor_profiles(&self, sensor: &str) -> Result<Vec<SdkProfile>>;

    /// Options supported by the sensor. `owner_name` is filled in later,
    /// when options are attached to the sensor's streams.
    fn sensor_options(&self, sensor: &str) -> Result<Vec<OptionDescriptor>>;

    fn video_intrinsics(&self, stream_name: &str) -> Option<VideoIntrinsics>;
    fn motion_intrinsics(&self, stream_name: &str) -> Option<MotionIntrinsics>;

    /// Extrinsics from one stream's frame of reference to another's.
    fn extrinsics(&self, from_stream: &str, to_stream: &str) -> Option<Extrinsics>;

    /// Open the sensor with all profiles that should be produced together.
    fn open(&self, sensor: &str, profiles: &[ProfileBinding]) -> Result<()>;

    /// Begin streaming; frames arrive through `callback` on an SDK thread.
    fn start(&self, sensor: &str, callback: FrameCallback) -> Result<()>;

    fn stop(&self, sensor: &str) -> Result<()>;

    fn close(&self, sensor: &str) -> Result<()>;

    fn set_option(&self, sensor: &str, option: &str, value: f32) -> Result<()>;

    fn get_option(&self, sensor: &str, option: &str) -> Result<f32>;
}

/// Change notification fired by [`Context`] on attach/detach.
pub enum DeviceChange {
    Added(Arc<dyn Camera>),
    Removed(String),
}

type DeviceChangeCallback = Box<dyn Fn(DeviceChange) + Send + Sync>;

/// Device watcher: tracks attached cameras and reports attach/detach.
///
/// Callbacks fire on the thread that mutates the device set, which is always
/// foreign to the bridge's dispatchers.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    devices: Mutex<HashMap<String, Arc<dyn Camera>>>,
    callback: Mutex<Option<DeviceChangeCallback>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                devices: Mutex::new(HashMap::new()),
                callback: Mutex::new(None),
            }),
        }
    }

    /// Install the change callback and replay the current device set into it.
    pub fn run<F>(&self, callback: F)
    where
        F: Fn(DeviceChange) + Send + Sync + 'static,
    {
        let devices: Vec<Arc<dyn Camera>> =
            self.inner.devices.lock().values().cloned().collect();
        for device in devices {
            callback(DeviceChange::Added(device));
        }
        *self.inner.callback.lock() = Some(Box::new(callback));
    }

    /// Attach a device. Duplicate serials are rejected.
    pub fn add_device(&self, device: Arc<dyn Camera>) -> Result<()> {
        let serial = device.serial();
        {
            let mut devices = self.inner.devices.lock();
            if devices.contains_key(&serial) {
                return Err(crate::error::Error::Conflict(format!(
                    "device '{}' already attached",
                    serial
                )));
            }
            devices.insert(serial.clone(), Arc::clone(&device));
        }
        if let Some(callback) = self.inner.callback.lock().as_ref() {
            callback(DeviceChange::Added(device));
        }
        Ok(())
    }

    /// Detach a device by serial.
    pub fn remove_device(&self, serial: &str) {
        let removed = self.inner.devices.lock().remove(serial);
        if removed.is_some()
            && let Some(callback) = self.inner.callback.lock().as_ref()
        {
            callback(DeviceChange::Removed(serial.to_string()));
        }
    }

    pub fn device_count(&self) -> usize {
        self.inner.devices.lock().len()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
