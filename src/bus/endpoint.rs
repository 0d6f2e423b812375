//! Reader and writer endpoints.

use super::participant::{Domain, Participant, Topic};
use super::{Durability, Guid, Qos, ReaderListener, WriterListener};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// One delivered payload plus the identity of the writer that produced it.
#[derive(Clone, Debug)]
pub struct Sample {
    pub data: Vec<u8>,
    pub writer: Guid,
}

pub(super) struct WriterInner {
    guid: Guid,
    topic_name: String,
    qos: Qos,
    domain: Arc<Domain>,
    listener: Option<Arc<dyn WriterListener>>,
    /// Retained samples, kept only for transient-local durability.
    retained: Mutex<VecDeque<Vec<u8>>>,
    matched: AtomicI32,
}

/// Per-endpoint handle bound to a topic with a QoS profile.
pub struct Writer {
    inner: Arc<WriterInner>,
}

impl Writer {
    pub(super) fn create(
        participant: &Participant,
        topic: &Topic,
        qos: Qos,
        listener: Option<Arc<dyn WriterListener>>,
    ) -> Result<Writer> {
        let inner = Arc::new(WriterInner {
            guid: participant.endpoint_guid(),
            topic_name: topic.name().to_string(),
            qos,
            domain: Arc::clone(&topic.domain),
            listener,
            retained: Mutex::new(VecDeque::new()),
            matched: AtomicI32::new(0),
        });

        let readers = {
            let mut topics = inner.domain.topics.lock();
            let entry = topics.get_mut(topic.name()).ok_or_else(|| {
                Error::NotFound(format!("topic '{}' is not registered", topic.name()))
            })?;
            entry.writers.push(Arc::downgrade(&inner));
            live(&mut entry.readers)
        };

        // Match notifications run outside the registry lock, on this thread.
        for reader in &readers {
            inner.matched.fetch_add(1, Ordering::Relaxed);
            if let Some(listener) = &inner.listener {
                listener.on_subscription_matched(1, reader.guid);
            }
            reader.notify_matched(1, inner.guid);
        }

        log::debug!("writer {} created on '{}'", inner.guid, inner.topic_name);
        Ok(Writer { inner })
    }

    pub fn guid(&self) -> Guid {
        self.inner.guid
    }

    pub fn topic_name(&self) -> &str {
        &self.inner.topic_name
    }

    pub fn matched_count(&self) -> i32 {
        self.inner.matched.load(Ordering::Relaxed)
    }

    /// Deliver one sample to every matched reader.
    ///
    /// With volatile durability a sample written while no reader is matched
    /// is simply lost; that is the broadcast replay problem the broadcaster
    /// solves at the application layer.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        let readers = {
            let mut topics = self.inner.domain.topics.lock();
            let entry = topics.get_mut(&self.inner.topic_name).ok_or_else(|| {
                Error::NotFound(format!("topic '{}' disappeared", self.inner.topic_name))
            })?;
            live(&mut entry.readers)
        };

        for reader in &readers {
            reader.push_sample(Sample {
                data: payload.to_vec(),
                writer: self.inner.guid,
            });
        }

        if self.inner.qos.durability == Durability::TransientLocal {
            let mut retained = self.inner.retained.lock();
            if retained.len() == self.inner.qos.history_depth {
                retained.pop_front();
            }
            retained.push_back(payload.to_vec());
        }
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let readers = {
            let mut topics = self.inner.domain.topics.lock();
            if let Some(entry) = topics.get_mut(&self.inner.topic_name) {
                let this = Arc::downgrade(&self.inner);
                entry.writers.retain(|w| !w.ptr_eq(&this));
                live(&mut entry.readers)
            } else {
                Vec::new()
            }
        };
        for reader in &readers {
            reader.notify_matched(-1, self.inner.guid);
        }
        log::debug!("writer {} deleted", self.inner.guid);
    }
}

pub(super) struct ReaderInner {
    pub(super) guid: Guid,
    topic_name: String,
    qos: Qos,
    domain: Arc<Domain>,
    listener: Option<Arc<dyn ReaderListener>>,
    history: Mutex<VecDeque<Sample>>,
    available: Condvar,
    matched: AtomicI32,
    deleted: AtomicBool,
}

impl ReaderInner {
    pub(super) fn push_sample(&self, sample: Sample) {
        if self.deleted.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut history = self.history.lock();
            if history.len() == self.qos.history_depth {
                // keep-last: the oldest unread sample is replaced.
                history.pop_front();
            }
            history.push_back(sample);
            self.available.notify_all();
        }
        if let Some(listener) = &self.listener {
            listener.on_data_available();
        }
    }

    pub(super) fn notify_matched(&self, delta: i32, writer: Guid) {
        self.matched.fetch_add(delta, Ordering::Relaxed);
        if let Some(listener) = &self.listener {
            listener.on_subscription_matched(delta, writer);
        }
    }
}

/// Subscribing endpoint with a keep-last history and a blocking wait.
pub struct Reader {
    inner: Arc<ReaderInner>,
}

impl Reader {
    pub(super) fn create(
        participant: &Participant,
        topic: &Topic,
        qos: Qos,
        listener: Option<Arc<dyn ReaderListener>>,
    ) -> Result<Reader> {
        let inner = Arc::new(ReaderInner {
            guid: participant.endpoint_guid(),
            topic_name: topic.name().to_string(),
            qos,
            domain: Arc::clone(&topic.domain),
            listener,
            history: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            matched: AtomicI32::new(0),
            deleted: AtomicBool::new(false),
        });

        let writers = {
            let mut topics = inner.domain.topics.lock();
            let entry = topics.get_mut(topic.name()).ok_or_else(|| {
                Error::NotFound(format!("topic '{}' is not registered", topic.name()))
            })?;
            entry.readers.push(Arc::downgrade(&inner));
            live(&mut entry.writers)
        };

        for writer in &writers {
            writer.matched.fetch_add(1, Ordering::Relaxed);
            if let Some(listener) = &writer.listener {
                listener.on_subscription_matched(1, inner.guid);
            }
            if writer.qos.durability == Durability::TransientLocal {
                for payload in writer.retained.lock().iter() {
                    inner.push_sample(Sample {
                        data: payload.clone(),
                        writer: writer.guid,
                    });
                }
            }
            inner.notify_matched(1, writer.guid);
        }

        log::debug!("reader {} created on '{}'", inner.guid, inner.topic_name);
        Ok(Reader { inner })
    }

    pub fn guid(&self) -> Guid {
        self.inner.guid
    }

    pub fn topic_name(&self) -> &str {
        &self.inner.topic_name
    }

    pub fn matched_count(&self) -> i32 {
        self.inner.matched.load(Ordering::Relaxed)
    }

    /// Drain all unread samples, oldest first.
    pub fn take(&self) -> Vec<Sample> {
        self.inner.history.lock().drain(..).collect()
    }

    /// Block until an unread sample is available or `timeout` elapses.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut history = self.inner.history.lock();
        while history.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner.available.wait_for(&mut history, deadline - now);
        }
        true
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.inner.deleted.store(true, Ordering::Relaxed);
        let writers = {
            let mut topics = self.inner.domain.topics.lock();
            if let Some(entry) = topics.get_mut(&self.inner.topic_name) {
                let this = Arc::downgrade(&self.inner);
                entry.readers.retain(|r| !r.ptr_eq(&this));
                live(&mut entry.writers)
            } else {
                Vec::new()
            }
        };
        for writer in &writers {
            writer.matched.fetch_sub(1, Ordering::Relaxed);
            if let Some(listener) = &writer.listener {
                listener.on_subscription_matched(-1, self.inner.guid);
            }
        }
        log::debug!("reader {} deleted", self.inner.guid);
    }
}

/// Prune dead endpoints and upgrade the rest.
fn live<T>(endpoints: &mut Vec<Weak<T>>) -> Vec<Arc<T>> {
    endpoints.retain(|e| e.strong_count() > 0);
    endpoints.iter().filter_map(Weak::upgrade).collect()
}
