//! Client-side watcher for the broadcast topic.
//!
//! Subscribes to the device-info topic, de-duplicates records by serial (a
//! replay may deliver a record twice when joins race) and reports device
//! arrival and disappearance. A writer going away on the broadcast topic is
//! how the server signals device removal, so the tracker maps each record's
//! writer identity to the serial it announced and treats the unmatch of that
//! writer as the device leaving.

use super::info::{DEVICE_INFO_TOPIC, DEVICE_INFO_TYPE, DeviceInfo};
use crate::bus::{Guid, Participant, Qos, Reader, ReaderListener};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(200);

type AddedCallback = Box<dyn Fn(DeviceInfo) + Send + Sync>;
type RemovedCallback = Box<dyn Fn(String) + Send + Sync>;

struct TrackerShared {
    /// Writer identity -> the device it announced.
    seen: Mutex<HashMap<Guid, DeviceInfo>>,
    /// Writers that unmatched since the last poll; drained by the worker.
    unmatched: Mutex<Vec<Guid>>,
    shutdown: AtomicBool,
    on_added: AddedCallback,
    on_removed: RemovedCallback,
}

/// Bus-thread listener: records which writers disappeared, nothing more.
struct InfoListener {
    shared: Weak<TrackerShared>,
}

impl ReaderListener for InfoListener {
    fn on_subscription_matched(&self, delta: i32, writer: Guid) {
        if delta < 0
            && let Some(shared) = self.shared.upgrade()
        {
            shared.unmatched.lock().push(writer);
        }
    }
}

/// Tracks the set of remote devices visible on the broadcast topic.
pub struct DeviceTracker {
    shared: Arc<TrackerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceTracker {
    pub fn new<A, R>(participant: &Participant, on_added: A, on_removed: R) -> Result<Self>
    where
        A: Fn(DeviceInfo) + Send + Sync + 'static,
        R: Fn(String) + Send + Sync + 'static,
    {
        let shared = Arc::new(TrackerShared {
            seen: Mutex::new(HashMap::new()),
            unmatched: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            on_added: Box::new(on_added),
            on_removed: Box::new(on_removed),
        });

        let topic = participant.create_topic(DEVICE_INFO_TOPIC, DEVICE_INFO_TYPE)?;
        let listener = Arc::new(InfoListener {
            shared: Arc::downgrade(&shared),
        });
        let reader = participant.create_subscriber().create_reader(
            &topic,
            Qos::reliable().keep_last(16),
            Some(listener),
        )?;

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("device-tracker".to_string())
            .spawn(move || Self::poll_loop(reader, worker_shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    fn poll_loop(reader: Reader, shared: Arc<TrackerShared>) {
        while !shared.shutdown.load(Ordering::Relaxed) {
            reader.wait_for_data(POLL);

            for sample in reader.take() {
                let info: DeviceInfo = match serde_json::from_slice(&sample.data) {
                    Ok(info) => info,
                    Err(e) => {
                        log::warn!("ignoring undecodable device-info record: {}", e);
                        continue;
                    }
                };
                let mut seen = shared.seen.lock();
                if seen.values().any(|known| known.serial == info.serial) {
                    log::debug!("duplicate record for device '{}'", info.serial);
                    continue;
                }
                log::info!("device '{}' ({}) discovered", info.name, info.serial);
                seen.insert(sample.writer, info.clone());
                drop(seen);
                (shared.on_added)(info);
            }

            let gone: Vec<Guid> = shared.unmatched.lock().drain(..).collect();
            for writer in gone {
                if let Some(info) = shared.seen.lock().remove(&writer) {
                    log::info!("device '{}' disappeared", info.serial);
                    (shared.on_removed)(info.serial);
                }
            }
        }
        log::debug!("device tracker exiting");
    }

    pub fn device_count(&self) -> usize {
        self.shared.seen.lock().len()
    }

    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Broadcaster;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn test_tracker_follows_add_and_remove() {
        let server = Participant::new(219, "server").unwrap();
        let client = Participant::new(219, "client").unwrap();
        let broadcaster = Broadcaster::new(&server).unwrap();
        broadcaster.run().unwrap();

        let added = Arc::new(StdMutex::new(Vec::new()));
        let removed = Arc::new(StdMutex::new(Vec::new()));
        let added_sink = Arc::clone(&added);
        let removed_sink = Arc::clone(&removed);
        let tracker = DeviceTracker::new(
            &client,
            move |info| added_sink.lock().unwrap().push(info.serial),
            move |serial| removed_sink.lock().unwrap().push(serial),
        )
        .unwrap();

        broadcaster.add_device(DeviceInfo::new("Intel RealSense D435", "A1", "D400", false));
        assert!(wait_until(Duration::from_secs(2), || tracker.device_count() == 1));
        assert_eq!(*added.lock().unwrap(), vec!["A1".to_string()]);

        broadcaster.remove_device("A1");
        assert!(wait_until(Duration::from_secs(2), || tracker.device_count() == 0));
        assert_eq!(*removed.lock().unwrap(), vec!["A1".to_string()]);

        tracker.stop();
        broadcaster.stop();
    }
}
