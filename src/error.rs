//! Error types for setu-bridge
//!
//! # Error Recovery Strategies
//!
//! ## Transient Errors (Retry Implicitly)
//!
//! - **`Io`**: A single sample failed to write. Logged by the caller; the
//!   next announce cycle or the next frame retries implicitly.
//!
//! ## Protocol Errors (Fail the Operation)
//!
//! - **`Protocol`**: The remote side violated the handshake (stream header
//!   before device header, duplicate stream name, out-of-range default
//!   profile index). The handshake fails and the device is discarded.
//! - **`Json`**: A record could not be decoded. Malformed notifications are
//!   logged and skipped outside the handshake; inside it they fail it.
//!
//! ## Request Errors (Answered with an `error` Notification)
//!
//! - **`BadRequest`**: A control request referenced a profile no stream can
//!   satisfy, or carried a non-numeric option value.
//! - **`NotFound`**: A stream, sensor or option named in a request does not
//!   exist on this device.
//! - **`Conflict`**: An entity already exists (duplicate serial, topic type
//!   mismatch) or is in the wrong state for the request.
//!
//! ## Fatal Errors (Fix and Restart)
//!
//! - **`Config`**: The configuration file is invalid. Fix it and restart.
//! - **`Timeout`**: The handshake watchdog expired; the device is unusable.
//! - **`Internal`**: A camera call or worker failed unexpectedly. The
//!   affected sensor is reverted; other sensors are unaffected.

use thiserror::Error;

/// Errors that can occur in setu-bridge
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
