//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [bus]
//! domain_id = 0        # DDS domain, 0-232
//!
//! [server]
//! metadata = true      # publish per-frame metadata records
//! queue_depth = 64     # per-device dispatcher and frame queue bound
//!
//! # Cameras served by the daemon. Models are built-in presets.
//! [[simulation.devices]]
//! model = "d435"
//! serial = "112233"
//!
//! [[simulation.devices]]
//! model = "d455"
//! serial = "445566"
//! ```
//!
//! All sections are optional; the defaults serve a single simulated D435.

use crate::camera::mock::MockCamera;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Bus configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// DDS domain id. Valid range 0-232.
    #[serde(default)]
    pub domain_id: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { domain_id: 0 }
    }
}

/// Per-device server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Publish per-frame metadata records for cameras that support them.
    #[serde(default = "default_metadata")]
    pub metadata: bool,

    /// Bound on each device's dispatcher queue and frame hand-off queue.
    /// Overflow drops the oldest entry, so undersizing this trades latency
    /// for frame loss.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_metadata() -> bool {
    true
}

fn default_queue_depth() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metadata: default_metadata(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// One simulated camera served by the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedDevice {
    /// Camera preset. Supported: "d435", "d455".
    pub model: String,
    pub serial: String,
}

impl SimulatedDevice {
    pub fn create_camera(&self) -> Result<MockCamera> {
        match self.model.as_str() {
            "d435" => Ok(MockCamera::d435(&self.serial)),
            "d455" => Ok(MockCamera::d455(&self.serial)),
            other => Err(Error::Config(format!("unknown camera model '{}'", other))),
        }
    }
}

/// Simulated hardware configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SimulationConfig {
    #[serde(default)]
    pub devices: Vec<SimulatedDevice>,
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            server: ServerConfig::default(),
            simulation: SimulationConfig {
                devices: vec![SimulatedDevice {
                    model: "d435".to_string(),
                    serial: "112233".to_string(),
                }],
            },
        }
    }
}

/// Maximum DDS domain id.
const MAX_DOMAIN_ID: u16 = 232;

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read config: {}", e)))?;

        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bus.domain_id > MAX_DOMAIN_ID {
            return Err(Error::Config(format!(
                "domain_id must be in [0, {}] (got {})",
                MAX_DOMAIN_ID, self.bus.domain_id
            )));
        }
        if self.server.queue_depth == 0 {
            return Err(Error::Config(
                "queue_depth must be at least 1".to_string(),
            ));
        }

        let mut serials = Vec::new();
        for device in &self.simulation.devices {
            if device.serial.is_empty() {
                return Err(Error::Config(format!(
                    "device model '{}' has an empty serial",
                    device.model
                )));
            }
            if serials.contains(&&device.serial) {
                return Err(Error::Config(format!(
                    "duplicate device serial '{}'",
                    device.serial
                )));
            }
            serials.push(&device.serial);
            // Fail unknown models at load time, not at attach time.
            device.create_camera()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.bus.domain_id, 0);
        assert!(config.server.metadata);
        assert_eq!(config.simulation.devices.len(), 1);
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = basic_toml::from_str(
            r#"
            [bus]
            domain_id = 42

            [server]
            metadata = false
            queue_depth = 16

            [[simulation.devices]]
            model = "d435"
            serial = "A1"

            [[simulation.devices]]
            model = "d455"
            serial = "B2"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.bus.domain_id, 42);
        assert!(!config.server.metadata);
        assert_eq!(config.simulation.devices.len(), 2);
    }

    #[test]
    fn test_domain_out_of_range_rejected() {
        let config: Config = basic_toml::from_str("[bus]\ndomain_id = 233\n").unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let config: Config = basic_toml::from_str(
            "[[simulation.devices]]\nmodel = \"t265\"\nserial = \"X\"\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_duplicate_serial_rejected() {
        let config: Config = basic_toml::from_str(
            "[[simulation.devices]]\nmodel = \"d435\"\nserial = \"X\"\n\n[[simulation.devices]]\nmodel = \"d455\"\nserial = \"X\"\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
