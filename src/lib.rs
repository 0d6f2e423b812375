//! Setu - a device bridge that exposes depth cameras on a DDS-style bus
//!
//! Locally attached cameras become first-class bus entities: remote clients
//! discover them on a broadcast topic, negotiate streaming profiles over a
//! per-device notification/control topic pair, and consume frames and
//! metadata from per-stream topics. The bus is the only interface; clients
//! never learn which host owns the hardware.
//!
//! The crate splits into the broadcast layer ([`broadcaster`]), the
//! per-device discovery handshake ([`device::server`] / [`device::client`]),
//! and the arbitration between declarative stream requests and imperative
//! sensor calls ([`bridge`]). Everything runs single-threaded-cooperative on
//! per-owner [`dispatcher`]s; bus callbacks only set flags and hand work off.

pub mod bridge;
pub mod broadcaster;
pub mod bus;
pub mod camera;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;

pub use config::Config;
pub use error::{Error, Result};
