//! Device-presence broadcasting with per-new-reader replay.
//!
//! Durability QoS cannot express "every subscriber sees the current device
//! set exactly once": transient-local would replay stale records for devices
//! that have since disappeared, and volatile drops the record before late
//! subscribers arrive. So the broadcaster keeps no log at all; instead, every
//! device gets its own writer on the shared broadcast topic, and a listener
//! on that writer flags it whenever a new reader matches. A dedicated
//! announcer loop wakes on the flag, scans all device handles on the
//! broadcaster dispatcher, and re-posts the current record for each flagged
//! writer. One wake-up is enough to serve any number of pending joins.
//!
//! Shared-memory delivery stays off on this topic: over shared memory a
//! sample can outrun the endpoint handshake and get discarded by a reader
//! that does not recognize the writer yet, while over the reliable path the
//! handshake completes first.
//!
//! Removing a device deletes its writer; subscribers observe the unmatch.

use crate::bus::{Guid, Participant, Publisher, Qos, Topic, WriterListener};
use crate::device::info::{DEVICE_INFO_TOPIC, DEVICE_INFO_TYPE, DeviceInfo};
use crate::dispatcher::{DEFAULT_QUEUE_DEPTH, Dispatcher};
use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

struct DeviceHandle {
    info: DeviceInfo,
    writer: crate::bus::Writer,
    /// Armed by the writer's listener whenever a new reader matches; cleared
    /// once the current record has been posted for that writer.
    needs_send: Arc<AtomicBool>,
}

struct Shared {
    publisher: Publisher,
    topic: Topic,
    /// Mutated only from the broadcaster dispatcher.
    devices: Mutex<HashMap<String, DeviceHandle>>,
    wake: Mutex<bool>,
    wake_cv: Condvar,
    active: AtomicBool,
}

/// Listener attached to each device writer. Runs on bus threads, so it only
/// sets flags and signals the announcer; the actual write happens on the
/// broadcaster dispatcher.
struct ClientListener {
    needs_send: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl WriterListener for ClientListener {
    fn on_subscription_matched(&self, delta: i32, reader: Guid) {
        if delta > 0 {
            log::debug!("device-info reader {} discovered", reader);
            let Some(shared) = self.shared.upgrade() else {
                return;
            };
            self.needs_send.store(true, Ordering::Relaxed);
            *shared.wake.lock() = true;
            shared.wake_cv.notify_all();
        } else {
            log::debug!("device-info reader {} disappeared", reader);
        }
    }
}

/// Announces attached devices on the broadcast topic for as long as they are
/// present, replaying the current record to every subscriber that joins.
pub struct Broadcaster {
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    announcer: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn new(participant: &Participant) -> Result<Self> {
        let topic = participant.create_topic(DEVICE_INFO_TOPIC, DEVICE_INFO_TYPE)?;
        Ok(Self {
            shared: Arc::new(Shared {
                publisher: participant.create_publisher(),
                topic,
                devices: Mutex::new(HashMap::new()),
                wake: Mutex::new(false),
                wake_cv: Condvar::new(),
                active: AtomicBool::new(false),
            }),
            dispatcher: Arc::new(Dispatcher::new("broadcaster", DEFAULT_QUEUE_DEPTH)),
            announcer: Mutex::new(None),
        })
    }

    /// Start the dispatcher and the announcer loop.
    pub fn run(&self) -> Result<()> {
        self.shared.active.store(true, Ordering::Relaxed);
        self.dispatcher.start();

        let shared = Arc::clone(&self.shared);
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = std::thread::Builder::new()
            .name("announcer".to_string())
            .spawn(move || {
                loop {
                    {
                        let mut wake = shared.wake.lock();
                        while !*wake && shared.active.load(Ordering::Relaxed) {
                            shared.wake_cv.wait(&mut wake);
                        }
                        if !shared.active.load(Ordering::Relaxed) {
                            break;
                        }
                        *wake = false;
                    }
                    let scan = Arc::clone(&shared);
                    dispatcher.invoke(move |_| announce_pending(&scan));
                }
                log::debug!("announcer exiting");
            })?;
        *self.announcer.lock() = Some(handle);
        log::info!("device broadcaster running");
        Ok(())
    }

    /// Register a device and arm it for replay. Returns the device topic root.
    ///
    /// The record itself is posted by the announcer: creating the writer
    /// matches any readers already on the topic, which flags the handle.
    pub fn add_device(&self, info: DeviceInfo) -> String {
        let topic_root = info.topic_root.clone();
        let shared = Arc::clone(&self.shared);
        self.dispatcher.invoke(move |_| {
            let mut devices = shared.devices.lock();
            if devices.contains_key(&info.serial) {
                log::warn!("device '{}' is already broadcast", info.serial);
                return;
            }
            let needs_send = Arc::new(AtomicBool::new(false));
            let listener = Arc::new(ClientListener {
                needs_send: Arc::clone(&needs_send),
                shared: Arc::downgrade(&shared),
            });
            let qos = Qos::reliable().keep_last(1).no_data_sharing();
            match shared
                .publisher
                .create_writer(&shared.topic, qos, Some(listener))
            {
                Ok(writer) => {
                    log::info!("broadcasting device '{}' ({})", info.name, info.serial);
                    devices.insert(
                        info.serial.clone(),
                        DeviceHandle {
                            info,
                            writer,
                            needs_send,
                        },
                    );
                }
                Err(e) => log::error!("failed to create device writer: {}", e),
            }
        });
        topic_root
    }

    /// Drop a device's writer; matched subscribers observe the unmatch.
    pub fn remove_device(&self, serial: &str) {
        let serial = serial.to_string();
        let shared = Arc::clone(&self.shared);
        self.dispatcher.invoke(move |_| {
            match shared.devices.lock().remove(&serial) {
                Some(handle) => {
                    log::info!("no longer broadcasting device '{}'", serial);
                    shared.publisher.delete_writer(handle.writer);
                }
                None => log::warn!("device '{}' was not broadcast", serial),
            }
        });
    }

    pub fn device_count(&self) -> usize {
        self.shared.devices.lock().len()
    }

    /// Wake the announcer, stop the dispatcher, drop all writers.
    pub fn stop(&self) {
        if !self.shared.active.swap(false, Ordering::Relaxed) {
            return;
        }
        self.shared.wake_cv.notify_all();
        if let Some(handle) = self.announcer.lock().take() {
            let _ = handle.join();
        }
        self.dispatcher.stop();
        // The dispatcher is stopped, so the handle map is ours now.
        self.shared.devices.lock().clear();
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Post the current record for every flagged handle. Runs on the broadcaster
/// dispatcher; a failed write leaves the flag armed for the next cycle.
fn announce_pending(shared: &Shared) {
    let devices = shared.devices.lock();
    for handle in devices.values() {
        if !handle.needs_send.load(Ordering::Relaxed) {
            continue;
        }
        let payload = match serde_json::to_vec(&handle.info) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("failed to encode device info: {}", e);
                continue;
            }
        };
        match handle.writer.write(&payload) {
            Ok(()) => {
                log::debug!("device info for '{}' sent", handle.info.serial);
                handle.needs_send.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!(
                    "failed to write device info for '{}': {}",
                    handle.info.serial,
                    e
                );
            }
        }
    }
}
