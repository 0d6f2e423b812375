//! Participant facade over the data bus.
//!
//! Thin, synchronous adapter exposing the bus primitives the bridge consumes:
//! participants, publishers/subscribers, named+typed topics, and
//! reader/writer endpoints with QoS. The implementation behind the facade is
//! an in-process domain registry; participants created with the same domain
//! id match each other's endpoints by topic name. This is the seam where a
//! real DDS binding slots in.
//!
//! Listener callbacks (`on_subscription_matched`, `on_data_available`) are
//! invoked on whatever thread triggered the event - always foreign to the
//! owner's dispatcher. Callbacks must complete in bounded time and may only
//! set flags and notify condition variables; they must not perform bus I/O.

mod endpoint;
mod participant;

pub use endpoint::{Reader, Sample, Writer};
pub use participant::{Participant, Publisher, Subscriber, Topic};

use std::fmt;

/// Maximum DDS domain id.
pub const MAX_DOMAIN_ID: u16 = 232;

/// Endpoint identity within a domain.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Guid {
    pub participant: u64,
    pub entity: u64,
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.participant, self.entity)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Reliability {
    Reliable,
    BestEffort,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Durability {
    Volatile,
    TransientLocal,
}

/// Per-endpoint quality of service.
#[derive(Clone, Debug)]
pub struct Qos {
    pub reliability: Reliability,
    pub durability: Durability,
    /// keep-last history bound.
    pub history_depth: usize,
    /// Shared-memory delivery. Must be off on the broadcast topic, where the
    /// samples may otherwise race the endpoint handshake.
    pub data_sharing: bool,
}

impl Default for Qos {
    fn default() -> Self {
        Self {
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            history_depth: 1,
            data_sharing: true,
        }
    }
}

impl Qos {
    pub fn reliable() -> Self {
        Self::default()
    }

    pub fn best_effort() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            ..Self::default()
        }
    }

    pub fn keep_last(mut self, depth: usize) -> Self {
        self.history_depth = depth.max(1);
        self
    }

    pub fn transient_local(mut self) -> Self {
        self.durability = Durability::TransientLocal;
        self
    }

    pub fn no_data_sharing(mut self) -> Self {
        self.data_sharing = false;
        self
    }
}

/// Writer-side events. Implementations must not perform bus I/O.
pub trait WriterListener: Send + Sync {
    /// A reader matched (`delta` = +1) or unmatched (`delta` = -1) this writer.
    fn on_subscription_matched(&self, _delta: i32, _reader: Guid) {}
}

/// Reader-side events. Implementations must not perform bus I/O.
pub trait ReaderListener: Send + Sync {
    fn on_data_available(&self) {}

    /// A writer matched or unmatched this reader.
    fn on_subscription_matched(&self, _delta: i32, _writer: Guid) {}
}
