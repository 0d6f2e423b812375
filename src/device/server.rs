//! Server-side endpoint for one attached camera.
//!
//! Owns the per-device topic tree rooted at the device's topic root:
//! announcements and errors go out on `/notification`, requests come in on
//! `/control`, frames fan out to `/<stream>` and per-frame records to
//! `/metadata`. All control handling, stream transitions and frame
//! publishing are serialized on the device's own dispatcher; bus and camera
//! callbacks only hand work off to it.
//!
//! Announcement replay works like the broadcast topic: a listener on the
//! notification writer arms a flag whenever a new reader matches, and the
//! dispatcher re-emits the device header plus stream headers so late-joining
//! clients can complete their handshake.

use super::extrinsics::ExtrinsicsEntry;
use super::info::DeviceInfo;
use super::messages::{DeviceMessage, FLEXIBLE_TYPE, FrameMetadata, MetadataHeader};
use super::stream::Stream;
use crate::bridge::{ProfileBinding, StreamBridge};
use crate::bus::{Guid, Participant, Qos, Reader, ReaderListener, Writer, WriterListener};
use crate::camera::{Camera, Frame, FrameCallback};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Registered type of per-stream frame topics.
const FRAME_TYPE: &str = "frame";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Publish per-frame metadata records (requires camera support).
    pub metadata: bool,
    /// Bound on the device dispatcher queue and the frame hand-off queue.
    pub queue_depth: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            metadata: true,
            queue_depth: 64,
        }
    }
}

struct ServerShared {
    participant: Participant,
    info: DeviceInfo,
    camera: Arc<dyn Camera>,
    dispatcher: Dispatcher,
    streams: BTreeMap<String, Stream>,
    extrinsics: Vec<ExtrinsicsEntry>,
    bridge: Mutex<StreamBridge>,
    notification_writer: OnceLock<Writer>,
    metadata_writer: OnceLock<Writer>,
    control_reader: Mutex<Option<Reader>>,
    frame_writers: Mutex<HashMap<String, Writer>>,
    /// SDK threads push here; the dispatcher drains.
    frame_queue: ArrayQueue<Frame>,
    pump_scheduled: AtomicBool,
    needs_announce: AtomicBool,
    metadata_enabled: bool,
    running: AtomicBool,
}

/// Notification-writer listener: flags the announcement replay for every new
/// reader. Runs on bus threads, so it does no bus I/O itself.
struct NotificationListener {
    shared: Weak<ServerShared>,
}

impl WriterListener for NotificationListener {
    fn on_subscription_matched(&self, delta: i32, reader: Guid) {
        if delta <= 0 {
            return;
        }
        log::debug!("notification reader {} discovered", reader);
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.needs_announce.store(true, Ordering::Relaxed);
        invoke_guarded(&shared, "announcement", |s| announce(s));
    }
}

/// Control-reader listener: hands the drain to the dispatcher.
struct ControlListener {
    shared: Weak<ServerShared>,
}

impl ReaderListener for ControlListener {
    fn on_data_available(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        invoke_guarded(&shared, "control handling", |s| handle_control(s));
    }
}

/// Run `task` on the device dispatcher with a failure sink: a panic is
/// logged and surfaced as an `error` notification instead of silently
/// dropping the client's request.
fn invoke_guarded<F>(shared: &Arc<ServerShared>, label: &'static str, task: F)
where
    F: FnOnce(&Arc<ServerShared>) + Send + 'static,
{
    let guarded = Arc::clone(shared);
    shared.dispatcher.invoke(move |_| {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task(&guarded)));
        if result.is_err() {
            publish_error(&guarded, &format!("internal failure in {}", label));
        }
    });
}

/// One attached device, served over the bus.
pub struct DeviceServer {
    shared: Arc<ServerShared>,
}

impl DeviceServer {
    /// Build the supported-streams list from the camera and prepare the
    /// bridge. Topics are not created until [`run`](Self::run).
    pub fn new(
        participant: &Participant,
        camera: Arc<dyn Camera>,
        options: ServerOptions,
    ) -> Result<Self> {
        let info = DeviceInfo::new(
            &camera.name(),
            &camera.serial(),
            &camera.product_line(),
            camera.locked(),
        );
        let streams = build_streams(camera.as_ref())?;
        let extrinsics = build_extrinsics(camera.as_ref(), &streams);

        let mut bridge = StreamBridge::new();
        let stream_list: Vec<Stream> = streams.values().cloned().collect();
        bridge.init(&stream_list);

        let metadata_enabled = options.metadata && camera.supports_metadata();
        log::info!(
            "device server for '{}' created with {} streams (metadata {})",
            info.serial,
            streams.len(),
            if metadata_enabled { "on" } else { "off" }
        );

        Ok(Self {
            shared: Arc::new(ServerShared {
                participant: participant.clone(),
                dispatcher: Dispatcher::new(&format!("device-{}", info.serial), options.queue_depth),
                info,
                camera,
                streams,
                extrinsics,
                bridge: Mutex::new(bridge),
                notification_writer: OnceLock::new(),
                metadata_writer: OnceLock::new(),
                control_reader: Mutex::new(None),
                frame_writers: Mutex::new(HashMap::new()),
                frame_queue: ArrayQueue::new(options.queue_depth.max(1)),
                pump_scheduled: AtomicBool::new(false),
                needs_announce: AtomicBool::new(false),
                metadata_enabled,
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    pub fn topic_root(&self) -> &str {
        &self.shared.info.topic_root
    }

    /// Create the per-device topics, install the bridge callbacks and emit
    /// the discovery announcement.
    pub fn run(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::Relaxed) {
            return Err(Error::Conflict(format!(
                "device server '{}' is already running",
                self.shared.info.serial
            )));
        }

        self.install_bridge_callbacks();

        let root = &self.shared.info.topic_root;
        let publisher = self.shared.participant.create_publisher();

        let notification_topic = self
            .shared
            .participant
            .create_topic(&format!("{}/notification", root), FLEXIBLE_TYPE)?;
        let listener = Arc::new(NotificationListener {
            shared: Arc::downgrade(&self.shared),
        });
        let writer = publisher.create_writer(
            &notification_topic,
            Qos::reliable().keep_last(10),
            Some(listener),
        )?;
        let _ = self.shared.notification_writer.set(writer);

        if self.shared.metadata_enabled {
            let metadata_topic = self
                .shared
                .participant
                .create_topic(&format!("{}/metadata", root), FLEXIBLE_TYPE)?;
            let writer =
                publisher.create_writer(&metadata_topic, Qos::reliable().keep_last(10), None)?;
            let _ = self.shared.metadata_writer.set(writer);
        }

        self.shared.dispatcher.start();
        self.shared.needs_announce.store(true, Ordering::Relaxed);
        invoke_guarded(&self.shared, "announcement", |s| announce(s));

        let control_topic = self
            .shared
            .participant
            .create_topic(&format!("{}/control", root), FLEXIBLE_TYPE)?;
        let reader = self.shared.participant.create_subscriber().create_reader(
            &control_topic,
            Qos::reliable().keep_last(10),
            Some(Arc::new(ControlListener {
                shared: Arc::downgrade(&self.shared),
            })),
        )?;
        *self.shared.control_reader.lock() = Some(reader);

        log::info!("device '{}' serving on '{}'", self.shared.info.serial, root);
        Ok(())
    }

    /// Tear down in listener-first order: the control reader goes away, the
    /// dispatcher drains, then the sensors are stopped.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::Relaxed) {
            return;
        }
        *self.shared.control_reader.lock() = None;
        self.shared.dispatcher.stop();
        // The dispatcher is stopped, so bridge state is ours now.
        let mut bridge = self.shared.bridge.lock();
        bridge.reset();
        bridge.commit();
        drop(bridge);
        self.shared.frame_writers.lock().clear();
        log::info!("device server '{}' stopped", self.shared.info.serial);
    }

    fn install_bridge_callbacks(&self) {
        let mut bridge = self.shared.bridge.lock();

        let weak = Arc::downgrade(&self.shared);
        bridge.on_start_sensor(move |sensor, profiles| start_sensor(&weak, sensor, profiles));

        let weak = Arc::downgrade(&self.shared);
        bridge.on_stop_sensor(move |sensor| {
            let shared = weak
                .upgrade()
                .ok_or_else(|| Error::Internal("device server is gone".to_string()))?;
            shared.camera.stop(sensor)?;
            shared.camera.close(sensor)?;
            log::info!("sensor '{}' stopped", sensor);
            Ok(())
        });

        let weak = Arc::downgrade(&self.shared);
        bridge.on_error(move |message| {
            if let Some(shared) = weak.upgrade() {
                publish_error(&shared, message);
            }
        });
    }
}

impl Drop for DeviceServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open+start one sensor and route its frames into the device queue.
fn start_sensor(weak: &Weak<ServerShared>, sensor: &str, profiles: &[ProfileBinding]) -> Result<()> {
    let shared = weak
        .upgrade()
        .ok_or_else(|| Error::Internal("device server is gone".to_string()))?;

    for binding in profiles {
        ensure_frame_writer(&shared, &binding.stream_name)?;
    }

    shared.camera.open(sensor, profiles)?;

    let callback_shared = Weak::clone(weak);
    let callback: FrameCallback = Arc::new(move |frame| {
        let Some(shared) = callback_shared.upgrade() else {
            return;
        };
        // Lock-free hand-off; the camera thread never blocks on the bus.
        if shared.frame_queue.force_push(frame).is_some() {
            log::trace!("frame queue full, dropped oldest frame");
        }
        if !shared.pump_scheduled.swap(true, Ordering::AcqRel) {
            invoke_guarded(&shared, "frame publishing", |s| pump_frames(s));
        }
    });

    match shared.camera.start(sensor, callback) {
        Ok(()) => {
            log::info!("sensor '{}' started with {} profiles", sensor, profiles.len());
            Ok(())
        }
        Err(e) => {
            // The sensor was opened; leave it closed rather than half-open.
            let _ = shared.camera.close(sensor);
            Err(e)
        }
    }
}

fn ensure_frame_writer(shared: &Arc<ServerShared>, stream_name: &str) -> Result<()> {
    let mut writers = shared.frame_writers.lock();
    if writers.contains_key(stream_name) {
        return Ok(());
    }
    let topic = shared.participant.create_topic(
        &format!("{}/{}", shared.info.topic_root, stream_name),
        FRAME_TYPE,
    )?;
    let writer = shared
        .participant
        .create_publisher()
        .create_writer(&topic, Qos::reliable(), None)?;
    writers.insert(stream_name.to_string(), writer);
    Ok(())
}

/// Emit the device header followed by one stream header per stream. Runs on
/// the device dispatcher; collapses redundant wake-ups through the flag.
fn announce(shared: &Arc<ServerShared>) {
    if !shared.needs_announce.swap(false, Ordering::Relaxed) {
        return;
    }
    let Some(writer) = shared.notification_writer.get() else {
        return;
    };

    let mut records = Vec::with_capacity(shared.streams.len() + 1);
    records.push(DeviceMessage::DeviceHeader {
        n_streams: shared.streams.len(),
        extrinsics: shared.extrinsics.clone(),
    });
    for stream in shared.streams.values() {
        records.push(DeviceMessage::StreamHeader {
            name: stream.name.clone(),
            kind: stream.kind,
            sensor_name: stream.sensor_name.clone(),
            default_profile_index: stream.default_profile_index,
            profiles: stream.profiles.clone(),
            options: stream.options.clone(),
            intrinsics: stream.intrinsics.clone(),
            motion_intrinsics: stream.motion_intrinsics.clone(),
        });
    }

    for record in records {
        match record.encode() {
            Ok(payload) => {
                if let Err(e) = writer.write(&payload) {
                    log::error!("failed to write '{}' record: {}", record.id(), e);
                }
            }
            Err(e) => log::error!("failed to encode '{}' record: {}", record.id(), e),
        }
    }
    log::debug!(
        "announced '{}' with {} streams",
        shared.info.serial,
        shared.streams.len()
    );
}

/// Drain and dispatch control records. Runs on the device dispatcher.
fn handle_control(shared: &Arc<ServerShared>) {
    let samples = match shared.control_reader.lock().as_ref() {
        Some(reader) => reader.take(),
        None => return,
    };

    for sample in samples {
        let message = match DeviceMessage::decode(&sample.data) {
            Ok(message) => message,
            Err(e) => {
                publish_error(shared, &format!("unrecognized control record: {}", e));
                continue;
            }
        };
        log::debug!("control '{}' received", message.id());
        let outcome = match message {
            DeviceMessage::OpenStreams {
                stream_profiles,
                reset,
                commit,
            } => handle_open_streams(shared, stream_profiles, reset, commit),
            DeviceMessage::CloseStreams { stream_names } => {
                handle_close_streams(shared, &stream_names)
            }
            DeviceMessage::SetOption {
                option_name,
                owner_name,
                value,
            } => handle_set_option(shared, &owner_name, &option_name, value),
            DeviceMessage::QueryOption {
                option_name,
                owner_name,
                ..
            } => handle_query_option(shared, &owner_name, &option_name),
            other => Err(Error::BadRequest(format!(
                "unexpected control '{}'",
                other.id()
            ))),
        };
        if let Err(e) = outcome {
            publish_error(shared, &e.to_string());
        }
    }
}

/// Map requested profiles onto the bridge. Every pair is validated before
/// the bridge is touched, so a bad request commits nothing.
fn handle_open_streams(
    shared: &Arc<ServerShared>,
    stream_profiles: BTreeMap<String, super::stream::Profile>,
    reset: bool,
    commit: bool,
) -> Result<()> {
    let mut bindings = Vec::with_capacity(stream_profiles.len());
    for (stream_name, requested) in &stream_profiles {
        let stream = shared
            .streams
            .get(stream_name)
            .ok_or_else(|| Error::NotFound(format!("invalid stream name '{}'", stream_name)))?;
        let declared = stream.find_profile(requested).ok_or_else(|| {
            Error::BadRequest(format!(
                "invalid profile {} for stream '{}'",
                requested, stream_name
            ))
        })?;
        bindings.push(ProfileBinding {
            stream_name: stream_name.clone(),
            sensor_name: stream.sensor_name.clone(),
            profile: declared.clone(),
        });
    }

    let mut bridge = shared.bridge.lock();
    if reset {
        bridge.reset();
    }
    for binding in bindings {
        bridge.open(binding);
    }
    if commit {
        bridge.commit();
    }
    Ok(())
}

fn handle_close_streams(shared: &Arc<ServerShared>, stream_names: &[String]) -> Result<()> {
    let mut bridge = shared.bridge.lock();
    for name in stream_names {
        bridge.close(name);
    }
    bridge.commit();
    Ok(())
}

/// Reach the owning sensor through the option's owner stream.
fn sensor_for_option(shared: &ServerShared, owner_name: &str, option_name: &str) -> Result<String> {
    let stream = shared
        .streams
        .get(owner_name)
        .ok_or_else(|| Error::NotFound(format!("no stream '{}' in device", owner_name)))?;
    if !stream.options.iter().any(|o| o.name == option_name) {
        return Err(Error::NotFound(format!(
            "no option '{}' on stream '{}'",
            option_name, owner_name
        )));
    }
    Ok(stream.sensor_name.clone())
}

fn handle_set_option(
    shared: &Arc<ServerShared>,
    owner_name: &str,
    option_name: &str,
    value: f32,
) -> Result<()> {
    let sensor = sensor_for_option(shared, owner_name, option_name)?;
    shared.camera.set_option(&sensor, option_name, value)
}

fn handle_query_option(
    shared: &Arc<ServerShared>,
    owner_name: &str,
    option_name: &str,
) -> Result<()> {
    let sensor = sensor_for_option(shared, owner_name, option_name)?;
    let value = shared.camera.get_option(&sensor, option_name)?;
    publish_notification(
        shared,
        &DeviceMessage::QueryOption {
            option_name: option_name.to_string(),
            owner_name: owner_name.to_string(),
            value: Some(value),
        },
    );
    Ok(())
}

/// Publish queued frames. Runs on the device dispatcher; frames whose stream
/// is no longer streaming are dropped silently.
fn pump_frames(shared: &Arc<ServerShared>) {
    shared.pump_scheduled.store(false, Ordering::Release);
    while let Some(frame) = shared.frame_queue.pop() {
        if !shared.bridge.lock().is_streaming(&frame.stream_name) {
            continue;
        }
        {
            let writers = shared.frame_writers.lock();
            let Some(writer) = writers.get(&frame.stream_name) else {
                continue;
            };
            if let Err(e) = writer.write(&frame.data) {
                log::debug!("failed to publish frame on '{}': {}", frame.stream_name, e);
                continue;
            }
        }
        if shared.metadata_enabled {
            publish_frame_metadata(shared, &frame);
        }
    }
}

fn publish_frame_metadata(shared: &Arc<ServerShared>, frame: &Frame) {
    let Some(writer) = shared.metadata_writer.get() else {
        return;
    };
    let record = FrameMetadata {
        stream_name: frame.stream_name.clone(),
        header: MetadataHeader {
            frame_id: frame.frame_number.to_string(),
            timestamp: frame.timestamp,
            timestamp_domain: frame.timestamp_domain.clone(),
            depth_units: frame.depth_units,
        },
        metadata: frame.metadata.iter().cloned().collect(),
    };
    match serde_json::to_vec(&record) {
        Ok(payload) => {
            if let Err(e) = writer.write(&payload) {
                log::debug!("failed to publish metadata: {}", e);
            }
        }
        Err(e) => log::error!("failed to encode metadata record: {}", e),
    }
}

fn publish_notification(shared: &Arc<ServerShared>, message: &DeviceMessage) {
    let Some(writer) = shared.notification_writer.get() else {
        return;
    };
    match message.encode() {
        Ok(payload) => {
            if let Err(e) = writer.write(&payload) {
                log::error!("failed to publish '{}' notification: {}", message.id(), e);
            }
        }
        Err(e) => log::error!("failed to encode '{}' notification: {}", message.id(), e),
    }
}

fn publish_error(shared: &Arc<ServerShared>, message: &str) {
    log::error!("device '{}': {}", shared.info.serial, message);
    publish_notification(
        shared,
        &DeviceMessage::Error {
            error: message.to_string(),
        },
    );
}

/// Group the camera's raw profiles into streams, mark defaults, attach the
/// owning sensor's options and the intrinsics.
fn build_streams(camera: &dyn Camera) -> Result<BTreeMap<String, Stream>> {
    let mut streams: BTreeMap<String, Stream> = BTreeMap::new();

    for sensor_name in camera.sensors() {
        for sdk_profile in camera.sensor_profiles(&sensor_name)? {
            let stream_name = sdk_profile.stream_name();
            match streams.get_mut(&stream_name) {
                Some(stream) => {
                    if stream.kind != sdk_profile.kind || stream.sensor_name != sensor_name {
                        log::error!(
                            "{} profile on stream '{}' that already has type {} on '{}'",
                            sdk_profile.kind,
                            stream_name,
                            stream.kind,
                            stream.sensor_name
                        );
                        continue;
                    }
                    if sdk_profile.is_default {
                        stream.default_profile_index = stream.profiles.len();
                    }
                    stream.profiles.push(sdk_profile.to_profile());
                }
                None => {
                    streams.insert(
                        stream_name.clone(),
                        Stream {
                            name: stream_name,
                            kind: sdk_profile.kind,
                            sensor_name: sensor_name.clone(),
                            profiles: vec![sdk_profile.to_profile()],
                            default_profile_index: 0,
                            options: Vec::new(),
                            intrinsics: None,
                            motion_intrinsics: None,
                        },
                    );
                }
            }
        }

        let options = camera.sensor_options(&sensor_name)?;
        for stream in streams.values_mut().filter(|s| s.sensor_name == sensor_name) {
            stream.options = options
                .iter()
                .cloned()
                .map(|mut option| {
                    option.owner_name = stream.name.clone();
                    option
                })
                .collect();
        }
    }

    streams.retain(|name, stream| {
        if stream.profiles.is_empty() {
            log::error!("ignoring stream '{}' with no profiles", name);
            false
        } else {
            true
        }
    });

    for stream in streams.values_mut() {
        if stream.kind.is_video() {
            stream.intrinsics = camera.video_intrinsics(&stream.name);
        } else {
            stream.motion_intrinsics = camera.motion_intrinsics(&stream.name);
        }
        stream.validate()?;
    }

    Ok(streams)
}

/// Extrinsics for every ordered pair of distinct streams.
fn build_extrinsics(
    camera: &dyn Camera,
    streams: &BTreeMap<String, Stream>,
) -> Vec<ExtrinsicsEntry> {
    let mut entries = Vec::new();
    for from in streams.keys() {
        for to in streams.keys() {
            if from == to {
                continue;
            }
            if let Some(extrinsics) = camera.extrinsics(from, to) {
                entries.push(ExtrinsicsEntry {
                    from: from.clone(),
                    to: to.clone(),
                    extrinsics,
                });
            }
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mock::{CameraTransition, MockCamera};
    use crate::device::client::RemoteDevice;
    use crate::device::stream::{Profile, StreamKind};
    use std::time::{Duration, Instant};

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

    fn server_client_pair(
        domain: u16,
        camera: Arc<MockCamera>,
    ) -> (Participant, DeviceServer, RemoteDevice) {
        let participant = Participant::new(domain, "test").unwrap();
        let server =
            DeviceServer::new(&participant, camera, ServerOptions::default()).unwrap();
        server.run().unwrap();

        let mut client = RemoteDevice::new(&participant, server.info().clone()).unwrap();
        client.run_with_deadline(Duration::from_secs(5)).unwrap();
        (participant, server, client)
    }

    fn depth_frame(number: u64) -> Frame {
        Frame {
            stream_name: "depth".to_string(),
            frame_number: number,
            timestamp: number as f64 * 33.3,
            timestamp_domain: "system-time".to_string(),
            depth_units: Some(0.001),
            data: vec![7u8; 32],
            metadata: vec![("Actual FPS".to_string(), 30)],
        }
    }

    #[test]
    fn test_handshake_against_live_server() {
        let camera = Arc::new(MockCamera::d435("S1"));
        let (_participant, server, client) = server_client_pair(220, camera);

        assert_eq!(server.topic_root(), "realsense/D435/S1");
        // depth, ir_1, ir_2, color
        assert_eq!(client.streams().count(), 4);
        let depth = client.stream("depth").unwrap();
        assert_eq!(depth.sensor_name, "Stereo Module");
        assert_eq!(depth.default_profile().fps(), 30);
        assert!(!depth.options.is_empty());
        assert!(depth.intrinsics.is_some());
        assert!(!client.extrinsics().is_empty());
    }

    #[test]
    fn test_open_commit_round_trip_is_idempotent() {
        let camera = Arc::new(MockCamera::d435("S2"));
        let (_participant, _server, client) = server_client_pair(221, Arc::clone(&camera));

        let mut request = BTreeMap::new();
        request.insert("depth".to_string(), Profile::video(640, 480, 30, "Z16"));
        client.open_streams(request.clone()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            camera
                .transitions()
                .iter()
                .any(|t| matches!(t, CameraTransition::Start(s) if s == "Stereo Module"))
        }));
        let transitions = camera.transitions();
        assert_eq!(
            transitions,
            vec![
                CameraTransition::Open("Stereo Module".to_string(), vec!["depth".to_string()]),
                CameraTransition::Start("Stereo Module".to_string()),
            ]
        );

        // The identical request is a no-op at the sensor level.
        client.open_streams(request).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(camera.transitions(), transitions);
    }

    #[test]
    fn test_frames_flow_with_metadata() {
        let camera = Arc::new(MockCamera::d435("S3"));
        let participant = Participant::new(222, "test").unwrap();
        let server = DeviceServer::new(
            &participant,
            Arc::clone(&camera) as Arc<dyn Camera>,
            ServerOptions::default(),
        )
        .unwrap();
        server.run().unwrap();
        let mut client = RemoteDevice::new(&participant, server.info().clone()).unwrap();
        client.run_with_deadline(Duration::from_secs(5)).unwrap();

        let mut request = BTreeMap::new();
        request.insert("depth".to_string(), Profile::video(640, 480, 30, "Z16"));
        client.open_streams(request).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            camera
                .transitions()
                .iter()
                .any(|t| matches!(t, CameraTransition::Start(_)))
        }));

        let root = server.topic_root().to_string();
        let frame_topic = participant
            .create_topic(&format!("{}/depth", root), FRAME_TYPE)
            .unwrap();
        let frame_reader = participant
            .create_subscriber()
            .create_reader(&frame_topic, Qos::reliable().keep_last(8), None)
            .unwrap();
        let metadata_topic = participant
            .create_topic(&format!("{}/metadata", root), FLEXIBLE_TYPE)
            .unwrap();
        let metadata_reader = participant
            .create_subscriber()
            .create_reader(&metadata_topic, Qos::reliable().keep_last(8), None)
            .unwrap();

        assert!(camera.inject_frame(depth_frame(42)));

        assert!(frame_reader.wait_for_data(Duration::from_secs(2)));
        let frames = frame_reader.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![7u8; 32]);

        assert!(metadata_reader.wait_for_data(Duration::from_secs(2)));
        let records = metadata_reader.take();
        let record: FrameMetadata = serde_json::from_slice(&records[0].data).unwrap();
        assert_eq!(record.stream_name, "depth");
        assert_eq!(record.header.frame_id, "42");
        assert_eq!(record.header.depth_units, Some(0.001));
        assert_eq!(record.metadata.get("Actual FPS"), Some(&30));
    }

    #[test]
    fn test_close_streams_stops_sensor() {
        let camera = Arc::new(MockCamera::d435("S4"));
        let (_participant, _server, client) = server_client_pair(223, Arc::clone(&camera));

        let mut request = BTreeMap::new();
        request.insert("depth".to_string(), Profile::video(640, 480, 30, "Z16"));
        client.open_streams(request).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            camera
                .transitions()
                .iter()
                .any(|t| matches!(t, CameraTransition::Start(_)))
        }));

        client.close_streams(&["depth"]).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            camera
                .transitions()
                .iter()
                .any(|t| matches!(t, CameraTransition::Close(_)))
        }));
        assert_eq!(
            camera.transitions(),
            vec![
                CameraTransition::Open("Stereo Module".to_string(), vec!["depth".to_string()]),
                CameraTransition::Start("Stereo Module".to_string()),
                CameraTransition::Stop("Stereo Module".to_string()),
                CameraTransition::Close("Stereo Module".to_string()),
            ]
        );
    }

    #[test]
    fn test_bad_open_request_commits_nothing_and_reports() {
        let camera = Arc::new(MockCamera::d435("S5"));
        let participant = Participant::new(224, "test").unwrap();
        let server = DeviceServer::new(
            &participant,
            Arc::clone(&camera) as Arc<dyn Camera>,
            ServerOptions::default(),
        )
        .unwrap();
        server.run().unwrap();
        let mut client = RemoteDevice::new(&participant, server.info().clone()).unwrap();
        client.run_with_deadline(Duration::from_secs(5)).unwrap();

        // One valid pair plus one unknown stream; the request must fail as a
        // whole, so the valid pair must not start either.
        let control_topic = participant
            .create_topic(
                &format!("{}/control", server.topic_root()),
                FLEXIBLE_TYPE,
            )
            .unwrap();
        let control_writer = participant
            .create_publisher()
            .create_writer(&control_topic, Qos::reliable().keep_last(10), None)
            .unwrap();
        control_writer
            .write(
                br#"{"id":"open-streams","stream-profiles":{"depth":{"w":640,"h":480,"fps":30,"format":"Z16"},"thermal":{"w":1,"h":1,"fps":1,"format":"X"}}}"#,
            )
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            client
                .take_notifications()
                .iter()
                .any(|m| matches!(m, DeviceMessage::Error { .. }))
        }));
        assert!(camera.transitions().is_empty());
    }

    #[test]
    fn test_set_and_query_option() {
        let camera = Arc::new(MockCamera::d435("S6"));
        let (_participant, _server, client) = server_client_pair(225, Arc::clone(&camera));

        client.set_option("depth", "Laser Power", 240.0).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            camera.get_option("Stereo Module", "Laser Power").unwrap() == 240.0
        }));

        client.query_option("depth", "Laser Power").unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            client.take_notifications().iter().any(|m| {
                matches!(
                    m,
                    DeviceMessage::QueryOption {
                        value: Some(v),
                        ..
                    } if *v == 240.0
                )
            })
        }));
    }

    #[test]
    fn test_start_failure_reverts_and_reports() {
        let camera = Arc::new(MockCamera::d435("S7"));
        camera.fail_next_start("Stereo Module");
        let (_participant, _server, client) = server_client_pair(226, Arc::clone(&camera));

        let mut request = BTreeMap::new();
        request.insert("depth".to_string(), Profile::video(640, 480, 30, "Z16"));
        client.open_streams(request.clone()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            client
                .take_notifications()
                .iter()
                .any(|m| matches!(m, DeviceMessage::Error { .. }))
        }));
        // The sensor was reverted; a retry works because the failure was
        // one-shot.
        client.open_streams(request).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            camera
                .transitions()
                .iter()
                .any(|t| matches!(t, CameraTransition::Start(_)))
        }));
    }

    #[test]
    fn test_motion_streams_announced() {
        let camera = Arc::new(MockCamera::d455("S8"));
        let (_participant, _server, client) = server_client_pair(227, camera);

        let accel = client.stream("accel").unwrap();
        assert_eq!(accel.kind, StreamKind::Accel);
        assert_eq!(accel.sensor_name, "Motion Module");
        assert!(accel.motion_intrinsics.is_some());
        assert!(!accel.profiles[0].is_video());
    }
}
