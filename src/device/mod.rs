//! Device model: presence records, streams, options, extrinsics, the wire
//! records, and the two ends of the discovery handshake.

pub mod client;
pub mod extrinsics;
pub mod info;
pub mod messages;
pub mod options;
pub mod server;
pub mod stream;
pub mod tracker;

pub use client::RemoteDevice;
pub use info::DeviceInfo;
pub use server::DeviceServer;
pub use tracker::DeviceTracker;
