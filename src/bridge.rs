//! Arbitration between declarative stream requests and imperative sensor
//! transitions.
//!
//! Clients declare *which profiles should be active*; the camera wants
//! *open/start/stop/close calls per sensor*, with the constraint that all
//! profiles opened on one sensor must be opened together and a sensor must be
//! stopped and closed before it can be reopened with a different set. The
//! bridge holds a pending set and a committed set per sensor and, on commit,
//! drives only the sensors whose committed set actually changes.

use crate::device::stream::{Profile, Stream};
use crate::error::Result;
use std::collections::{BTreeMap, HashMap};

/// A requested profile bound to the stream and sensor it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileBinding {
    pub stream_name: String,
    pub sensor_name: String,
    pub profile: Profile,
}

/// Lifecycle of one physical sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensorState {
    #[default]
    Closed,
    /// Profiles handed to the sensor; streaming not confirmed yet.
    Open,
    Streaming,
}

#[derive(Default)]
struct SensorEntry {
    state: SensorState,
    /// Profiles this sensor is currently committed to, keyed by stream name.
    committed: BTreeMap<String, ProfileBinding>,
}

type StartFn = Box<dyn Fn(&str, &[ProfileBinding]) -> Result<()> + Send>;
type StopFn = Box<dyn Fn(&str) -> Result<()> + Send>;
type ErrorFn = Box<dyn Fn(&str) + Send>;

/// Per-sensor arbitration of open/start/stop/close.
///
/// All methods run on the owning device's dispatcher; the bridge itself is
/// not synchronized.
pub struct StreamBridge {
    sensors: BTreeMap<String, SensorEntry>,
    stream_to_sensor: HashMap<String, String>,
    /// Profiles requested since the last commit, one per stream.
    pending: BTreeMap<String, ProfileBinding>,
    on_start_sensor: Option<StartFn>,
    on_stop_sensor: Option<StopFn>,
    on_error: Option<ErrorFn>,
}

impl StreamBridge {
    pub fn new() -> Self {
        Self {
            sensors: BTreeMap::new(),
            stream_to_sensor: HashMap::new(),
            pending: BTreeMap::new(),
            on_start_sensor: None,
            on_stop_sensor: None,
            on_error: None,
        }
    }

    /// Register the streams this device exposes. Must be called before any
    /// profile can be opened.
    pub fn init(&mut self, streams: &[Stream]) {
        for stream in streams {
            self.sensors.entry(stream.sensor_name.clone()).or_default();
            self.stream_to_sensor
                .insert(stream.name.clone(), stream.sensor_name.clone());
        }
    }

    /// Imperatively open+start a sensor with the given profiles.
    pub fn on_start_sensor<F>(&mut self, callback: F)
    where
        F: Fn(&str, &[ProfileBinding]) -> Result<()> + Send + 'static,
    {
        self.on_start_sensor = Some(Box::new(callback));
    }

    /// Imperatively stop+close a sensor.
    pub fn on_stop_sensor<F>(&mut self, callback: F)
    where
        F: Fn(&str) -> Result<()> + Send + 'static,
    {
        self.on_stop_sensor = Some(Box::new(callback));
    }

    pub fn on_error<F>(&mut self, callback: F)
    where
        F: Fn(&str) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
    }

    /// Add `binding` to the pending set. Requesting a stream that already has
    /// a pending profile replaces it; declaring intent twice is not an error.
    pub fn open(&mut self, binding: ProfileBinding) {
        if !self.sensors.contains_key(&binding.sensor_name) {
            log::error!(
                "ignoring profile for unknown sensor '{}'",
                binding.sensor_name
            );
            return;
        }
        if let Some(previous) = self
            .pending
            .insert(binding.stream_name.clone(), binding.clone())
            && previous.profile != binding.profile
        {
            log::debug!(
                "pending profile for '{}' replaced ({} -> {})",
                binding.stream_name,
                previous.profile,
                binding.profile
            );
        }
    }

    /// Remove `stream_name` from the pending set. Closing a stream that is
    /// not pending is a no-op.
    pub fn close(&mut self, stream_name: &str) {
        self.pending.remove(stream_name);
    }

    /// Clear the pending set.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Reconcile every sensor with the pending set.
    ///
    /// A sensor whose desired set equals its committed set is left alone.
    /// Otherwise it is stopped (if needed) and, when the desired set is
    /// non-empty, restarted with it. A failed start reverts that sensor to
    /// closed and reports through `on_error`; other sensors are unaffected.
    pub fn commit(&mut self) {
        let sensor_names: Vec<String> = self.sensors.keys().cloned().collect();
        for sensor_name in sensor_names {
            let desired: BTreeMap<String, ProfileBinding> = self
                .pending
                .iter()
                .filter(|(_, b)| b.sensor_name == sensor_name)
                .map(|(name, b)| (name.clone(), b.clone()))
                .collect();

            let Some(entry) = self.sensors.get_mut(&sensor_name) else {
                continue;
            };
            if entry.committed == desired {
                continue;
            }

            if entry.state != SensorState::Closed {
                if let Some(stop) = &self.on_stop_sensor
                    && let Err(e) = stop(&sensor_name)
                {
                    log::error!("failed to stop sensor '{}': {}", sensor_name, e);
                }
                entry.state = SensorState::Closed;
                entry.committed.clear();
            }

            if desired.is_empty() {
                continue;
            }

            let profiles: Vec<ProfileBinding> = desired.values().cloned().collect();
            entry.state = SensorState::Open;
            let started = match &self.on_start_sensor {
                Some(start) => start(&sensor_name, &profiles),
                None => Ok(()),
            };
            let Some(entry) = self.sensors.get_mut(&sensor_name) else {
                continue;
            };
            match started {
                Ok(()) => {
                    entry.state = SensorState::Streaming;
                    entry.committed = desired;
                }
                Err(e) => {
                    entry.state = SensorState::Closed;
                    entry.committed.clear();
                    let message =
                        format!("failed to start sensor '{}': {}", sensor_name, e);
                    log::error!("{}", message);
                    if let Some(error) = &self.on_error {
                        error(&message);
                    }
                }
            }
        }
    }

    pub fn is_streaming(&self, stream_name: &str) -> bool {
        let Some(sensor_name) = self.stream_to_sensor.get(stream_name) else {
            return false;
        };
        let Some(entry) = self.sensors.get(sensor_name) else {
            return false;
        };
        entry.state == SensorState::Streaming && entry.committed.contains_key(stream_name)
    }

    pub fn sensor_state(&self, sensor_name: &str) -> Option<SensorState> {
        self.sensors.get(sensor_name).map(|e| e.state)
    }
}

impl Default for StreamBridge {
    fn default() -> Self {
        Self::new()
    }
}
