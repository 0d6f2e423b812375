//! Participants, publishers/subscribers and the topic registry.

use super::endpoint::{Reader, ReaderInner, Writer, WriterInner};
use super::{Guid, MAX_DOMAIN_ID, Qos, ReaderListener, WriterListener};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// One entry per topic name: the registered type plus the live endpoints.
#[derive(Default)]
pub(super) struct TopicEntry {
    pub(super) type_name: String,
    pub(super) writers: Vec<Weak<WriterInner>>,
    pub(super) readers: Vec<Weak<ReaderInner>>,
}

/// In-process stand-in for a DDS domain. Participants created with the same
/// id share one `Domain` and therefore discover each other's endpoints.
pub(super) struct Domain {
    pub(super) id: u16,
    pub(super) topics: Mutex<HashMap<String, TopicEntry>>,
    next_participant: AtomicU64,
    next_entity: AtomicU64,
}

impl Domain {
    fn get(id: u16) -> Arc<Domain> {
        static DOMAINS: OnceLock<Mutex<HashMap<u16, Arc<Domain>>>> = OnceLock::new();
        let domains = DOMAINS.get_or_init(|| Mutex::new(HashMap::new()));
        Arc::clone(domains.lock().entry(id).or_insert_with(|| {
            Arc::new(Domain {
                id,
                topics: Mutex::new(HashMap::new()),
                next_participant: AtomicU64::new(1),
                next_entity: AtomicU64::new(1),
            })
        }))
    }

    pub(super) fn next_guid(&self, participant: u64) -> Guid {
        Guid {
            participant,
            entity: self.next_entity.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// A named, typed channel on the bus.
#[derive(Clone)]
pub struct Topic {
    pub(super) name: String,
    pub(super) type_name: String,
    pub(super) domain: Arc<Domain>,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

struct ParticipantInner {
    id: u64,
    name: String,
    domain: Arc<Domain>,
}

/// Bus-level identity hosting publishers and subscribers within a domain.
#[derive(Clone)]
pub struct Participant {
    inner: Arc<ParticipantInner>,
}

impl Participant {
    pub fn new(domain_id: u16, name: &str) -> Result<Self> {
        if domain_id > MAX_DOMAIN_ID {
            return Err(Error::Config(format!(
                "domain id {} out of range [0, {}]",
                domain_id, MAX_DOMAIN_ID
            )));
        }
        let domain = Domain::get(domain_id);
        let id = domain.next_participant.fetch_add(1, Ordering::Relaxed);
        log::debug!("participant '{}' joined domain {}", name, domain_id);
        Ok(Self {
            inner: Arc::new(ParticipantInner {
                id,
                name: name.to_string(),
                domain,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn domain_id(&self) -> u16 {
        self.inner.domain.id
    }

    pub fn create_publisher(&self) -> Publisher {
        Publisher {
            participant: self.clone(),
        }
    }

    pub fn create_subscriber(&self) -> Subscriber {
        Subscriber {
            participant: self.clone(),
        }
    }

    /// Register `name` with `type_name`, or look it up if already registered.
    /// Re-registering with a different type is a conflict.
    pub fn create_topic(&self, name: &str, type_name: &str) -> Result<Topic> {
        let mut topics = self.inner.domain.topics.lock();
        match topics.get(name) {
            Some(entry) if entry.type_name != type_name => {
                return Err(Error::Conflict(format!(
                    "topic '{}' already registered with type '{}'",
                    name, entry.type_name
                )));
            }
            Some(_) => {}
            None => {
                topics.insert(
                    name.to_string(),
                    TopicEntry {
                        type_name: type_name.to_string(),
                        ..TopicEntry::default()
                    },
                );
            }
        }
        Ok(Topic {
            name: name.to_string(),
            type_name: type_name.to_string(),
            domain: Arc::clone(&self.inner.domain),
        })
    }

    /// Remove a topic with no remaining endpoints.
    pub fn delete_topic(&self, topic: &Topic) -> Result<()> {
        let mut topics = self.inner.domain.topics.lock();
        if let Some(entry) = topics.get_mut(&topic.name) {
            entry.writers.retain(|w| w.strong_count() > 0);
            entry.readers.retain(|r| r.strong_count() > 0);
            if !entry.writers.is_empty() || !entry.readers.is_empty() {
                return Err(Error::Conflict(format!(
                    "topic '{}' still has endpoints",
                    topic.name
                )));
            }
            topics.remove(&topic.name);
        }
        Ok(())
    }

    pub(super) fn endpoint_guid(&self) -> Guid {
        self.inner.domain.next_guid(self.inner.id)
    }
}

/// Factory for writers.
#[derive(Clone)]
pub struct Publisher {
    participant: Participant,
}

impl Publisher {
    pub fn create_writer(
        &self,
        topic: &Topic,
        qos: Qos,
        listener: Option<Arc<dyn WriterListener>>,
    ) -> Result<Writer> {
        Writer::create(&self.participant, topic, qos, listener)
    }

    /// Delete a writer; matched readers observe the unmatch.
    pub fn delete_writer(&self, writer: Writer) {
        drop(writer);
    }
}

/// Factory for readers.
#[derive(Clone)]
pub struct Subscriber {
    participant: Participant,
}

impl Subscriber {
    pub fn create_reader(
        &self,
        topic: &Topic,
        qos: Qos,
        listener: Option<Arc<dyn ReaderListener>>,
    ) -> Result<Reader> {
        Reader::create(&self.participant, topic, qos, listener)
    }

    pub fn delete_reader(&self, reader: Reader) {
        drop(reader);
    }
}
