//! Client-side view of a remote device.
//!
//! A [`RemoteDevice`] sees only topics: it consumes the discovery stream on
//! `<topic-root>/notification` to build a local mirror of the remote streams,
//! then encodes requests onto `<topic-root>/control`. Requests are
//! fire-and-forget at the transport level; acknowledgement is observing the
//! resulting state change (frames start flowing) or an `error` notification.

use super::extrinsics::ExtrinsicsEntry;
use super::info::DeviceInfo;
use super::messages::{DeviceMessage, FLEXIBLE_TYPE};
use super::stream::{Profile, Stream};
use crate::bus::{Participant, Qos, Reader, Writer};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Wall-clock bound on the whole discovery conversation.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on one wait for the next notification inside the handshake.
const NOTIFICATION_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    WaitDeviceHeader,
    WaitProfiles,
    Done,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandshakeState::WaitDeviceHeader => "WAIT_DEVICE_HEADER",
            HandshakeState::WaitProfiles => "WAIT_PROFILES",
            HandshakeState::Done => "DONE",
        })
    }
}

/// A remote camera discovered over the bus.
pub struct RemoteDevice {
    info: DeviceInfo,
    notification_reader: Reader,
    control_writer: Writer,
    streams: BTreeMap<String, Stream>,
    extrinsics: Vec<ExtrinsicsEntry>,
    running: bool,
}

impl RemoteDevice {
    /// Stand up the notification reader and control writer for `info`'s
    /// topic root. Discovery does not start until [`run`](Self::run).
    pub fn new(participant: &Participant, info: DeviceInfo) -> Result<Self> {
        let notification_topic = participant.create_topic(
            &format!("{}/notification", info.topic_root),
            FLEXIBLE_TYPE,
        )?;
        let notification_reader = participant.create_subscriber().create_reader(
            &notification_topic,
            Qos::reliable().keep_last(10),
            None,
        )?;

        let control_topic =
            participant.create_topic(&format!("{}/control", info.topic_root), FLEXIBLE_TYPE)?;
        let control_writer = participant.create_publisher().create_writer(
            &control_topic,
            Qos::reliable().keep_last(10),
            None,
        )?;

        Ok(Self {
            info,
            notification_reader,
            control_writer,
            streams: BTreeMap::new(),
            extrinsics: Vec::new(),
            running: false,
        })
    }

    /// Run the discovery handshake under the 30 second watchdog.
    pub fn run(&mut self) -> Result<()> {
        self.run_with_deadline(HANDSHAKE_TIMEOUT)
    }

    /// As [`run`](Self::run) with an explicit watchdog, so expiry is testable.
    pub fn run_with_deadline(&mut self, timeout: Duration) -> Result<()> {
        if self.running {
            return Err(Error::Conflict(format!(
                "device '{}' is already running",
                self.info.name
            )));
        }
        self.init(timeout)?;
        self.running = true;
        log::debug!("device '{}' initialized successfully", self.info.topic_root);
        Ok(())
    }

    /// The handshake state machine.
    ///
    /// `WAIT_DEVICE_HEADER` tolerates unexpected records (logged, state
    /// kept); once profiles are expected, anything that is not a fresh valid
    /// stream header invalidates the handshake.
    fn init(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = HandshakeState::WaitDeviceHeader;
        let mut n_streams_expected = 0usize;

        while state != HandshakeState::Done {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "no complete stream data from '{}' within {:?}; state is {}",
                    self.info.topic_root, timeout, state
                )));
            }
            let wait = (deadline - now).min(NOTIFICATION_POLL);
            if !self.notification_reader.wait_for_data(wait) {
                continue;
            }

            for sample in self.notification_reader.take() {
                let message = match DeviceMessage::decode(&sample.data) {
                    Ok(message) => message,
                    Err(e) if state == HandshakeState::WaitDeviceHeader => {
                        log::warn!("ignoring undecodable notification: {}", e);
                        continue;
                    }
                    Err(e) => {
                        return Err(Error::Protocol(format!(
                            "undecodable notification in {}: {}",
                            state, e
                        )));
                    }
                };

                match (state, message) {
                    (
                        HandshakeState::WaitDeviceHeader,
                        DeviceMessage::DeviceHeader {
                            n_streams,
                            extrinsics,
                        },
                    ) => {
                        log::debug!("... device-header: {} streams expected", n_streams);
                        n_streams_expected = n_streams;
                        self.extrinsics = extrinsics;
                        state = if n_streams == 0 {
                            HandshakeState::Done
                        } else {
                            HandshakeState::WaitProfiles
                        };
                    }
                    (HandshakeState::WaitDeviceHeader, other) => {
                        log::warn!("ignoring '{}' while waiting for device header", other.id());
                    }
                    (
                        HandshakeState::WaitProfiles,
                        DeviceMessage::StreamHeader {
                            name,
                            kind,
                            sensor_name,
                            default_profile_index,
                            profiles,
                            options,
                            intrinsics,
                            motion_intrinsics,
                        },
                    ) => {
                        if self.streams.len() >= n_streams_expected {
                            return Err(Error::Protocol(format!(
                                "more streams than the {} expected",
                                n_streams_expected
                            )));
                        }
                        if self.streams.contains_key(&name) {
                            return Err(Error::Protocol(format!(
                                "stream '{}' already exists",
                                name
                            )));
                        }
                        let stream = Stream {
                            name: name.clone(),
                            kind,
                            sensor_name,
                            profiles,
                            default_profile_index,
                            options,
                            intrinsics,
                            motion_intrinsics,
                        };
                        stream.validate()?;
                        log::debug!(
                            "... stream '{}' ({}/{}) received with {} profiles",
                            name,
                            self.streams.len() + 1,
                            n_streams_expected,
                            stream.profiles.len()
                        );
                        self.streams.insert(name, stream);
                        if self.streams.len() == n_streams_expected {
                            state = HandshakeState::Done;
                        }
                    }
                    (current, other) => {
                        return Err(Error::Protocol(format!(
                            "unexpected notification '{}' in {}",
                            other.id(),
                            current
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    pub fn stream(&self, name: &str) -> Option<&Stream> {
        self.streams.get(name)
    }

    pub fn extrinsics(&self) -> &[ExtrinsicsEntry] {
        &self.extrinsics
    }

    /// Request that exactly the given profiles become active.
    ///
    /// Every stream must be known locally and able to satisfy its requested
    /// profile; the request is not sent otherwise.
    pub fn open_streams(&self, requests: BTreeMap<String, Profile>) -> Result<()> {
        if requests.is_empty() {
            return Err(Error::BadRequest(
                "must provide at least one profile".to_string(),
            ));
        }
        for (name, profile) in &requests {
            let stream = self
                .streams
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("no stream '{}' in device", name)))?;
            if stream.find_profile(profile).is_none() {
                return Err(Error::BadRequest(format!(
                    "profile {} is not supported by stream '{}'",
                    profile, name
                )));
            }
        }
        self.write_control(&DeviceMessage::OpenStreams {
            stream_profiles: requests,
            reset: true,
            commit: true,
        })
    }

    /// Request that the named streams stop.
    pub fn close_streams(&self, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            return Err(Error::BadRequest(
                "must provide at least one stream".to_string(),
            ));
        }
        for name in names {
            if !self.streams.contains_key(*name) {
                return Err(Error::NotFound(format!("no stream '{}' in device", name)));
            }
        }
        self.write_control(&DeviceMessage::CloseStreams {
            stream_names: names.iter().map(|n| n.to_string()).collect(),
        })
    }

    pub fn set_option(&self, owner_name: &str, option_name: &str, value: f32) -> Result<()> {
        self.find_option(owner_name, option_name)?;
        self.write_control(&DeviceMessage::SetOption {
            option_name: option_name.to_string(),
            owner_name: owner_name.to_string(),
            value,
        })
    }

    /// Ask for the current value; the reply arrives as a `query-option`
    /// notification carrying the value.
    pub fn query_option(&self, owner_name: &str, option_name: &str) -> Result<()> {
        self.find_option(owner_name, option_name)?;
        self.write_control(&DeviceMessage::QueryOption {
            option_name: option_name.to_string(),
            owner_name: owner_name.to_string(),
            value: None,
        })
    }

    /// Drain notifications received since the last call. Undecodable records
    /// are logged and skipped.
    pub fn take_notifications(&self) -> Vec<DeviceMessage> {
        self.notification_reader
            .take()
            .iter()
            .filter_map(|sample| match DeviceMessage::decode(&sample.data) {
                Ok(message) => Some(message),
                Err(e) => {
                    log::warn!("ignoring undecodable notification: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Block until at least one notification is available.
    pub fn wait_for_notification(&self, timeout: Duration) -> bool {
        self.notification_reader.wait_for_data(timeout)
    }

    fn find_option(&self, owner_name: &str, option_name: &str) -> Result<()> {
        let stream = self
            .streams
            .get(owner_name)
            .ok_or_else(|| Error::NotFound(format!("no stream '{}' in device", owner_name)))?;
        if !stream.options.iter().any(|o| o.name == option_name) {
            return Err(Error::NotFound(format!(
                "no option '{}' on stream '{}'",
                option_name, owner_name
            )));
        }
        Ok(())
    }

    fn write_control(&self, message: &DeviceMessage) -> Result<()> {
        self.control_writer.write(&message.encode()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Publisher;
    use crate::device::stream::StreamKind;

    const SERVER_QOS_DEPTH: usize = 10;

    struct TestServer {
        writer: Writer,
    }

    impl TestServer {
        fn new(publisher: &Publisher, participant: &Participant, root: &str) -> Self {
            let topic = participant
                .create_topic(&format!("{}/notification", root), FLEXIBLE_TYPE)
                .unwrap();
            let writer = publisher
                .create_writer(&topic, Qos::reliable().keep_last(SERVER_QOS_DEPTH), None)
                .unwrap();
            Self { writer }
        }

        fn send(&self, message: &DeviceMessage) {
            self.writer.write(&message.encode().unwrap()).unwrap();
        }

        fn send_raw(&self, payload: &[u8]) {
            self.writer.write(payload).unwrap();
        }
    }

    fn device_pair(domain: u16) -> (Participant, RemoteDevice, TestServer) {
        let participant = Participant::new(domain, "test").unwrap();
        let info = DeviceInfo::new("Intel RealSense D435", "112233", "D400", false);
        let root = info.topic_root.clone();
        let device = RemoteDevice::new(&participant, info).unwrap();
        let server = TestServer::new(&participant.create_publisher(), &participant, &root);
        (participant, device, server)
    }

    fn depth_header() -> DeviceMessage {
        DeviceMessage::StreamHeader {
            name: "depth".to_string(),
            kind: StreamKind::Depth,
            sensor_name: "Stereo Module".to_string(),
            default_profile_index: 0,
            profiles: vec![Profile::video(640, 480, 30, "Z16")],
            options: Vec::new(),
            intrinsics: None,
            motion_intrinsics: None,
        }
    }

    fn color_header() -> DeviceMessage {
        DeviceMessage::StreamHeader {
            name: "color".to_string(),
            kind: StreamKind::Color,
            sensor_name: "RGB Camera".to_string(),
            default_profile_index: 0,
            profiles: vec![Profile::video(640, 480, 30, "RGB8")],
            options: Vec::new(),
            intrinsics: None,
            motion_intrinsics: None,
        }
    }

    fn header(n_streams: usize) -> DeviceMessage {
        DeviceMessage::DeviceHeader {
            n_streams,
            extrinsics: Vec::new(),
        }
    }

    #[test]
    fn test_handshake_happy_path() {
        let (_participant, mut device, server) = device_pair(210);
        server.send(&header(2));
        server.send(&depth_header());
        server.send(&color_header());

        device.run_with_deadline(Duration::from_secs(2)).unwrap();
        assert!(device.is_running());
        assert_eq!(device.streams().count(), 2);
        assert_eq!(
            device.stream("depth").unwrap().sensor_name,
            "Stereo Module"
        );
        assert_eq!(device.stream("color").unwrap().kind, StreamKind::Color);
    }

    #[test]
    fn test_handshake_zero_streams_is_done() {
        let (_participant, mut device, server) = device_pair(211);
        server.send(&header(0));
        device.run_with_deadline(Duration::from_secs(2)).unwrap();
        assert_eq!(device.streams().count(), 0);
    }

    #[test]
    fn test_duplicate_stream_name_fails() {
        let (_participant, mut device, server) = device_pair(212);
        server.send(&header(2));
        server.send(&depth_header());
        server.send(&depth_header());

        let err = device.run_with_deadline(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
        assert!(!device.is_running());
    }

    #[test]
    fn test_default_index_out_of_bounds_fails() {
        let (_participant, mut device, server) = device_pair(213);
        server.send(&header(1));
        server.send(&DeviceMessage::StreamHeader {
            name: "depth".to_string(),
            kind: StreamKind::Depth,
            sensor_name: "Stereo Module".to_string(),
            default_profile_index: 3,
            profiles: vec![Profile::video(640, 480, 30, "Z16")],
            options: Vec::new(),
            intrinsics: None,
            motion_intrinsics: None,
        });

        let err = device.run_with_deadline(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
    }

    #[test]
    fn test_unknown_stream_type_fails() {
        let (_participant, mut device, server) = device_pair(214);
        server.send(&header(1));
        server.send_raw(
            br#"{"id":"stream-header","name":"x","type":"thermal","sensor-name":"s","default-profile-index":0,"profiles":[]}"#,
        );

        let err = device.run_with_deadline(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
    }

    #[test]
    fn test_extra_stream_header_fails() {
        let (_participant, mut device, server) = device_pair(215);
        server.send(&header(1));
        server.send(&depth_header());
        server.send(&color_header());

        let err = device.run_with_deadline(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
    }

    #[test]
    fn test_stream_header_before_device_header_is_ignored() {
        let (_participant, mut device, server) = device_pair(216);
        // Stale record before the header: logged, state kept.
        server.send(&depth_header());
        server.send(&header(1));
        server.send(&depth_header());

        device.run_with_deadline(Duration::from_secs(2)).unwrap();
        assert_eq!(device.streams().count(), 1);
    }

    #[test]
    fn test_watchdog_expiry_fails_handshake() {
        let (_participant, mut device, _server) = device_pair(217);
        let err = device
            .run_with_deadline(Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);
    }

    #[test]
    fn test_open_streams_validates_locally() {
        let (_participant, mut device, server) = device_pair(218);
        server.send(&header(1));
        server.send(&depth_header());
        device.run_with_deadline(Duration::from_secs(2)).unwrap();

        let mut unknown = BTreeMap::new();
        unknown.insert("color".to_string(), Profile::video(640, 480, 30, "RGB8"));
        assert!(matches!(
            device.open_streams(unknown),
            Err(Error::NotFound(_))
        ));

        let mut unsupported = BTreeMap::new();
        unsupported.insert("depth".to_string(), Profile::video(320, 240, 5, "Z16"));
        assert!(matches!(
            device.open_streams(unsupported),
            Err(Error::BadRequest(_))
        ));

        let mut good = BTreeMap::new();
        good.insert("depth".to_string(), Profile::video(640, 480, 30, "Z16"));
        device.open_streams(good).unwrap();
    }
}
