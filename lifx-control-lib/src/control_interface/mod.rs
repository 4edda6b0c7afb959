use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::led::hsbk::Hsbk;
use crate::protocol::message_type::*;
use crate::protocol::payload::{
    EchoPayload, GroupState, HostFirmwareState, LabelPayload, LightState, PowerLevel, ServiceState,
    SetColor, VersionState, WifiInfoState, WirePayload,
};
use crate::protocol::{message_name, DeviceId, DecodeError, Frame, GroupId};
use crate::util::config::{ControllerConfig, RetryPolicy};
use crate::util::tracker::{HandlerId, RequestTracker, TimerFired};
use crate::util::transport::{CorrelationId, InboundFrame, OutboundRequest, SendFlags, Transport};

pub mod controller;
pub mod device;
pub mod events;

pub use device::{Device, DiscoveryStep, Group, ProductCapabilities};
pub use events::LightEvent;

/// Heartbeats faster than this are refused.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/**
 * Owns every known device and group and drives the per-device discovery sequence.
 *
 * A device is created the first time it answers a service query. From then on each
 * reply triggers the next query in a fixed order:
 *
 * label, host firmware, wifi info, version, group, light state
 *
 * and the light state reply ends discovery for that device with a
 * [`LightEvent::DiscoveryFinished`]. Only the reply for the step a device is
 * waiting on moves it forward, so duplicated or stray replies cannot fork or cut
 * short the sequence. Replies that arrive after discovery produce change events
 * instead.
 *
 * The registry is not shared. It lives inside the controller's event loop, which
 * feeds it frames, retry timer fires, heartbeat ticks and commands one at a time.
 */
pub struct DeviceRegistry {
    transport: Arc<Transport>,
    tracker: RequestTracker,
    devices: BTreeMap<DeviceId, Device>,
    groups: BTreeMap<GroupId, Group>,
    products: HashMap<u32, ProductCapabilities>,
    heartbeats: HashMap<DeviceId, JoinHandle<()>>,
    heartbeat_tx: mpsc::UnboundedSender<DeviceId>,
    events: broadcast::Sender<LightEvent>,
    request_policy: RetryPolicy,
    address_discovery_policy: RetryPolicy,
}

impl DeviceRegistry {
    pub fn new(
        transport: Arc<Transport>,
        timer_tx: mpsc::UnboundedSender<TimerFired>,
        heartbeat_tx: mpsc::UnboundedSender<DeviceId>,
        events: broadcast::Sender<LightEvent>,
        config: &ControllerConfig,
    ) -> Self {
        DeviceRegistry {
            tracker: RequestTracker::new(transport.clone(), timer_tx),
            transport,
            devices: BTreeMap::new(),
            groups: BTreeMap::new(),
            products: HashMap::new(),
            heartbeats: HashMap::new(),
            heartbeat_tx,
            events,
            request_policy: config.request_policy,
            address_discovery_policy: config.address_discovery_policy,
        }
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Publish an event. Having no subscribers is not an error.
    fn emit(&self, event: LightEvent) {
        let _ = self.events.send(event);
    }

    // Discovery

    /// Broadcast a service query. Replies are not tracked; every answering device
    /// enters the discovery sequence.
    pub fn start_discovery(&mut self) -> CorrelationId {
        info!("Broadcasting discovery to {}", self.transport.broadcast_address());
        self.transport.broadcast_discovery()
    }

    /// Ask one address for its service, retrying with the address discovery policy.
    pub fn discover_by_address(&mut self, address: SocketAddr) -> HandlerId {
        info!("Discovering device at {}", address);
        self.tracker.issue(
            OutboundRequest::discovery(address),
            self.address_discovery_policy,
        )
    }

    // Inbound

    /// Correlate a frame with pending requests, then apply it to the device it came from.
    pub fn on_frame(&mut self, inbound: &InboundFrame) {
        for event in self.tracker.on_frame(&inbound.frame) {
            self.emit(LightEvent::Request(event));
        }

        let frame = &inbound.frame;
        let id = frame.header.device_id();
        let result = match frame.header.message_type {
            STATE_SERVICE => self.on_service(id, inbound),
            STATE_LABEL => self.on_label(id, frame),
            STATE_HOST_FIRMWARE => self.on_host_firmware(id, frame),
            STATE_WIFI_INFO => self.on_wifi_info(id, frame),
            STATE_VERSION => self.on_version(id, frame),
            STATE_GROUP => self.on_group(id, frame),
            LIGHT_STATE => self.on_light_state(id, frame),
            STATE_POWER => self.on_power(id, frame),
            ECHO_REPLY => self.on_echo(id, frame),
            ACKNOWLEDGEMENT => {
                debug!("Acknowledgement from {} (source {:08x})", id, frame.header.source);
                Ok(())
            }
            // our own broadcast looped back
            GET_SERVICE => Ok(()),
            other => {
                warn!(
                    "Ignoring message type {} ({}) from {}",
                    other,
                    message_name(other),
                    inbound.sender
                );
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!("Dropping {} from {}: {}", frame, inbound.sender, e);
        }
    }

    /// Feed a retry timer fire to the tracker.
    pub fn on_timer(&mut self, fired: TimerFired) {
        for event in self.tracker.on_timer(fired) {
            self.emit(LightEvent::Request(event));
        }
    }

    fn known_device(&mut self, id: DeviceId, frame: &Frame) -> Option<&mut Device> {
        let device = self.devices.get_mut(&id);
        if device.is_none() {
            debug!(
                "{} from unknown device {}",
                message_name(frame.header.message_type),
                id
            );
        }
        device
    }

    fn on_service(&mut self, id: DeviceId, inbound: &InboundFrame) -> Result<(), DecodeError> {
        let state = ServiceState::decode(&inbound.frame.payload)?;
        if id.is_broadcast() {
            debug!("Service announcement without a target from {}", inbound.sender);
            return Ok(());
        }
        let port = match u16::try_from(state.port) {
            Ok(0) | Err(_) => inbound.sender.port(),
            Ok(port) => port,
        };
        let address = SocketAddr::new(inbound.sender.ip(), port);

        match self.devices.get_mut(&id) {
            Some(device) => {
                if device.socket_addr() != address {
                    info!("Device {} moved to {}", id, address);
                    device.address = address.ip();
                    device.port = address.port();
                }
                device.service = state.service;
            }
            None => {
                info!("Discovered device {} at {}", id, address);
                let mut device = Device::new(id, address, state.service);
                device.discovery = Some(DiscoveryStep::Label);
                self.devices.insert(id, device);
                self.continue_discovery(id);
            }
        }
        Ok(())
    }

    /// Query the next discovery step for `id`, or announce that discovery finished.
    fn continue_discovery(&mut self, id: DeviceId) {
        let Some(device) = self.devices.get(&id) else {
            return;
        };
        match device.discovery {
            Some(step) => {
                self.query(id, step.query());
            }
            None => {
                info!("Discovery finished for {}", device);
                let snapshot = device.clone();
                self.emit(LightEvent::DiscoveryFinished(snapshot));
            }
        }
    }

    fn on_label(&mut self, id: DeviceId, frame: &Frame) -> Result<(), DecodeError> {
        let state = LabelPayload::decode(&frame.payload)?;
        let Some(device) = self.known_device(id, frame) else {
            return Ok(());
        };
        device.label = state.label;
        match advance(device, DiscoveryStep::Label) {
            Progress::Advanced => self.continue_discovery(id),
            Progress::Idle => {
                let snapshot = device.clone();
                self.emit(LightEvent::LabelChanged(snapshot));
            }
            Progress::Waiting => {}
        }
        Ok(())
    }

    fn on_host_firmware(&mut self, id: DeviceId, frame: &Frame) -> Result<(), DecodeError> {
        let state = HostFirmwareState::decode(&frame.payload)?;
        let Some(device) = self.known_device(id, frame) else {
            return Ok(());
        };
        device.firmware_major = state.major;
        device.firmware_minor = state.minor;
        device.firmware_build = state.build;
        if advance(device, DiscoveryStep::HostFirmware) == Progress::Advanced {
            self.continue_discovery(id);
        }
        Ok(())
    }

    fn on_wifi_info(&mut self, id: DeviceId, frame: &Frame) -> Result<(), DecodeError> {
        let state = WifiInfoState::decode(&frame.payload)?;
        let Some(device) = self.known_device(id, frame) else {
            return Ok(());
        };
        device.signal = state.signal;
        match advance(device, DiscoveryStep::WifiInfo) {
            Progress::Advanced => self.continue_discovery(id),
            Progress::Idle => {
                let snapshot = device.clone();
                self.emit(LightEvent::SignalChanged(snapshot));
            }
            Progress::Waiting => {}
        }
        Ok(())
    }

    fn on_version(&mut self, id: DeviceId, frame: &Frame) -> Result<(), DecodeError> {
        let state = VersionState::decode(&frame.payload)?;
        let capabilities = self.products.get(&state.product).cloned();
        let Some(device) = self.known_device(id, frame) else {
            return Ok(());
        };
        device.vendor_id = state.vendor;
        device.product_id = state.product;
        if capabilities.is_some() {
            device.capabilities = capabilities;
        }
        if advance(device, DiscoveryStep::Version) == Progress::Advanced {
            self.continue_discovery(id);
        }
        Ok(())
    }

    fn on_group(&mut self, id: DeviceId, frame: &Frame) -> Result<(), DecodeError> {
        let state = GroupState::decode(&frame.payload)?;
        let Some(device) = self.known_device(id, frame) else {
            return Ok(());
        };
        device.group_id = Some(state.group);
        device.group_label = state.label.clone();
        let progress = advance(device, DiscoveryStep::Group);

        let mut left = Vec::new();
        for group in self.groups.values_mut() {
            if group.id != state.group && group.remove(id) {
                debug!("Device {} left group {}", id, group.label);
                left.push(group.clone());
            }
        }
        for group in left {
            self.emit(LightEvent::GroupChanged(group));
        }

        let group = match self.groups.get_mut(&state.group) {
            Some(group) => {
                if state.updated_at > group.updated_at {
                    group.label = state.label;
                    group.updated_at = state.updated_at;
                }
                group.add(id);
                group.clone()
            }
            None => {
                info!("New group {} ({})", state.label, state.group);
                let mut group = Group::new(state.group, state.label, state.updated_at);
                group.add(id);
                self.groups.insert(group.id, group.clone());
                self.emit(LightEvent::NewGroup {
                    id: group.id,
                    label: group.label.clone(),
                });
                group
            }
        };
        self.emit(LightEvent::GroupChanged(group));

        if progress == Progress::Advanced {
            self.continue_discovery(id);
        }
        Ok(())
    }

    fn on_light_state(&mut self, id: DeviceId, frame: &Frame) -> Result<(), DecodeError> {
        let state = LightState::decode(&frame.payload)?;
        let Some(device) = self.known_device(id, frame) else {
            return Ok(());
        };
        device.color = state.color;
        device.power = state.power;
        if !state.label.is_empty() {
            device.label = state.label;
        }
        match advance(device, DiscoveryStep::LightState) {
            Progress::Advanced => self.continue_discovery(id),
            Progress::Idle => {
                let snapshot = device.clone();
                self.emit(LightEvent::StateChanged(snapshot));
            }
            Progress::Waiting => {}
        }
        Ok(())
    }

    fn on_power(&mut self, id: DeviceId, frame: &Frame) -> Result<(), DecodeError> {
        let state = PowerLevel::decode(&frame.payload)?;
        let Some(device) = self.known_device(id, frame) else {
            return Ok(());
        };
        device.power = state.level;
        if !device.discovery_in_progress() {
            let snapshot = device.clone();
            self.emit(LightEvent::PowerChanged(snapshot));
        }
        Ok(())
    }

    fn on_echo(&mut self, id: DeviceId, frame: &Frame) -> Result<(), DecodeError> {
        let echo = EchoPayload::decode(&frame.payload)?;
        let Some(device) = self.known_device(id, frame) else {
            return Ok(());
        };
        if echo.nonce != device.last_echo_nonce {
            debug!(
                "Echo from {} carried nonce {:016x}, expected {:016x}",
                id, echo.nonce, device.last_echo_nonce
            );
            return Ok(());
        }
        device.heartbeat_pending = false;
        let snapshot = device.clone();
        self.emit(LightEvent::EchoOk(snapshot));
        Ok(())
    }

    // Commands

    fn request(
        &mut self,
        id: DeviceId,
        message_type: u16,
        payload: Bytes,
        flags: SendFlags,
        policy: RetryPolicy,
    ) -> Option<HandlerId> {
        let Some(device) = self.devices.get(&id) else {
            warn!(
                "Not sending {} to unknown device {}",
                message_name(message_type),
                id
            );
            return None;
        };
        let request = OutboundRequest::targeted(device.socket_addr(), id, message_type)
            .with_payload(payload)
            .with_flags(flags);
        Some(self.tracker.issue(request, policy))
    }

    fn query(&mut self, id: DeviceId, message_type: u16) -> Option<HandlerId> {
        self.request(
            id,
            message_type,
            Bytes::new(),
            SendFlags::default(),
            self.request_policy,
        )
    }

    fn group_members(&self, group: GroupId) -> Vec<DeviceId> {
        match self.groups.get(&group) {
            Some(group) => group.members().to_vec(),
            None => {
                warn!("Unknown group {}", group);
                Vec::new()
            }
        }
    }

    /// Change the color over `duration_ms`. With `ack_required` the device is asked
    /// for an acknowledgement, otherwise for the resulting light state.
    pub fn set_color(
        &mut self,
        device: impl Into<DeviceId>,
        color: Hsbk,
        duration_ms: u32,
        ack_required: bool,
    ) -> Option<HandlerId> {
        let payload = SetColor { color, duration_ms }.encode();
        let flags = SendFlags {
            ack_required,
            res_required: !ack_required,
        };
        self.request(device.into(), SET_COLOR, payload, flags, self.request_policy)
    }

    /// Change only the brightness, keeping the hue, saturation and kelvin last
    /// reported by the device.
    pub fn set_brightness(
        &mut self,
        device: impl Into<DeviceId>,
        brightness: u16,
        ack_required: bool,
    ) -> Option<HandlerId> {
        let id = device.into();
        let Some(known) = self.devices.get(&id) else {
            warn!("Cannot change brightness of unknown device {}", id);
            return None;
        };
        let color = known.color.with_brightness(brightness);
        self.set_color(id, color, 0, ack_required)
    }

    pub fn set_power(&mut self, device: impl Into<DeviceId>, on: bool) -> Option<HandlerId> {
        self.request(
            device.into(),
            SET_POWER,
            PowerLevel::from_on(on).encode(),
            SendFlags::response(),
            self.request_policy,
        )
    }

    pub fn set_group_power(&mut self, group: GroupId, on: bool) -> Vec<HandlerId> {
        self.group_members(group)
            .into_iter()
            .filter_map(|id| self.set_power(id, on))
            .collect()
    }

    pub fn set_group_color(&mut self, group: GroupId, color: Hsbk, duration_ms: u32) -> Vec<HandlerId> {
        self.group_members(group)
            .into_iter()
            .filter_map(|id| self.set_color(id, color, duration_ms, false))
            .collect()
    }

    /// Reboot a device. Sent once with an acknowledgement request, never resent.
    pub fn reboot(&mut self, device: impl Into<DeviceId>) -> Option<HandlerId> {
        self.request(
            device.into(),
            SET_REBOOT,
            Bytes::new(),
            SendFlags::ack(),
            self.request_policy.without_retries(),
        )
    }

    pub fn reboot_group(&mut self, group: GroupId) -> Vec<HandlerId> {
        self.group_members(group)
            .into_iter()
            .filter_map(|id| self.reboot(id))
            .collect()
    }

    pub fn set_label(&mut self, device: impl Into<DeviceId>, label: &str) -> Option<HandlerId> {
        let payload = LabelPayload {
            label: label.to_string(),
        }
        .encode();
        self.request(
            device.into(),
            SET_LABEL,
            payload,
            SendFlags::response(),
            self.request_policy,
        )
    }

    pub fn refresh_color(&mut self, device: impl Into<DeviceId>) -> Option<HandlerId> {
        self.query(device.into(), GET_COLOR)
    }

    pub fn refresh_power(&mut self, device: impl Into<DeviceId>) -> Option<HandlerId> {
        self.query(device.into(), GET_POWER)
    }

    /// Query the light state of every known device.
    pub fn refresh_all(&mut self) -> Vec<HandlerId> {
        let ids: Vec<DeviceId> = self.devices.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.query(id, GET_COLOR))
            .collect()
    }

    /// Stop retrying a request. No further events are published for it.
    pub fn cancel(&mut self, handler: HandlerId) -> bool {
        self.tracker.stop(handler)
    }

    // Heartbeat

    /// Send an echo request to `device` every `interval`, replacing any previous
    /// heartbeat for it.
    /// # Returns
    /// `false` if the device is unknown or the interval is shorter than
    /// [`MIN_HEARTBEAT_INTERVAL`].
    pub fn enable_heartbeat(&mut self, device: impl Into<DeviceId>, interval: Duration) -> bool {
        let id = device.into();
        if interval < MIN_HEARTBEAT_INTERVAL {
            warn!(
                "Heartbeat interval {:?} for {} is below the {:?} minimum",
                interval, id, MIN_HEARTBEAT_INTERVAL
            );
            return false;
        }
        let Some(device) = self.devices.get_mut(&id) else {
            warn!("Cannot enable heartbeat for unknown device {}", id);
            return false;
        };
        device.heartbeat_pending = false;

        let ticks = self.heartbeat_tx.clone();
        let task = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if ticks.send(id).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.heartbeats.insert(id, task) {
            previous.abort();
        }
        debug!("Heartbeat for {} every {:?}", id, interval);
        true
    }

    pub fn disable_heartbeat(&mut self, device: impl Into<DeviceId>) -> bool {
        let id = device.into();
        match self.heartbeats.remove(&id) {
            Some(task) => {
                task.abort();
                if let Some(device) = self.devices.get_mut(&id) {
                    device.heartbeat_pending = false;
                }
                true
            }
            None => false,
        }
    }

    /// One heartbeat tick for `id`.
    pub fn on_heartbeat(&mut self, id: DeviceId) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        if device.heartbeat_pending {
            warn!("Missed heartbeat from {}", device);
        }
        let nonce = rand::random::<u64>();
        device.last_echo_nonce = nonce;
        device.heartbeat_pending = true;
        let destination = device.socket_addr();
        trace!("Heartbeat echo {:016x} to {}", nonce, id);
        self.transport.send_to(
            destination,
            id,
            ECHO_REQUEST,
            EchoPayload { nonce }.encode(),
            SendFlags::default(),
        );
    }

    // Capabilities and queries

    /// Replace the product table and apply it to devices already known.
    pub fn set_product_capabilities(&mut self, table: HashMap<u32, ProductCapabilities>) {
        for device in self.devices.values_mut() {
            if let Some(capabilities) = table.get(&device.product_id) {
                device.capabilities = Some(capabilities.clone());
            }
        }
        self.products = table;
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    /// All devices, ordered by id.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    pub fn device_by_label(&self, label: &str) -> Option<&Device> {
        self.devices.values().find(|device| device.label == label)
    }

    pub fn devices_by_product(&self, product_id: u32) -> Vec<Device> {
        self.devices
            .values()
            .filter(|device| device.product_id == product_id)
            .cloned()
            .collect()
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn group_by_label(&self, label: &str) -> Option<&Group> {
        self.groups.values().find(|group| group.label == label)
    }

    pub fn groups(&self) -> Vec<Group> {
        self.groups.values().cloned().collect()
    }

    /// Stop all heartbeats and outstanding requests.
    pub fn shutdown(&mut self) {
        for (_, task) in self.heartbeats.drain() {
            task.abort();
        }
        self.tracker.stop_all();
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for task in self.heartbeats.values() {
            task.abort();
        }
    }
}

/// Where a reply leaves the discovery sequence of its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Discovery is over; the reply is a change.
    Idle,
    /// The reply answered the step being waited for.
    Advanced,
    /// Duplicate or unrelated reply while waiting for another step.
    Waiting,
}

fn advance(device: &mut Device, step: DiscoveryStep) -> Progress {
    match device.discovery {
        None => Progress::Idle,
        Some(current) if current == step => {
            device.discovery = step.next();
            Progress::Advanced
        }
        Some(current) => {
            debug!(
                "{} waiting for {:?}, not advancing on {:?}",
                device.id, current, step
            );
            Progress::Waiting
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::led::hsbk::NamedColor;
    use crate::protocol::payload::POWER_ON;
    use crate::protocol::{decode, encode, FrameHeader};
    use crate::util::testing::RecordingLink;
    use crate::util::tracker::{RequestEvent, RequestState};

    const KITCHEN: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
    const DOWNSTAIRS: GroupId = GroupId([0x42; 16]);
    const UPSTAIRS: GroupId = GroupId([0x43; 16]);

    fn kitchen() -> DeviceId {
        DeviceId::from_mac(KITCHEN)
    }

    fn device_addr() -> SocketAddr {
        "192.168.1.50:56700".parse().unwrap()
    }

    fn inbound(target: DeviceId, source: u32, message_type: u16, payload: &[u8]) -> InboundFrame {
        let header = FrameHeader {
            source,
            target: target.0,
            ..FrameHeader::new(message_type)
        };
        InboundFrame {
            frame: decode(&encode(&header, payload)).unwrap(),
            sender: device_addr(),
        }
    }

    struct Harness {
        registry: DeviceRegistry,
        link: Arc<RecordingLink>,
        events: broadcast::Receiver<LightEvent>,
        heartbeats: mpsc::UnboundedReceiver<DeviceId>,
        _timers: mpsc::UnboundedReceiver<TimerFired>,
    }

    impl Harness {
        fn new() -> Self {
            let link = RecordingLink::new();
            let transport = Arc::new(Transport::new(
                link.clone(),
                "255.255.255.255:56700".parse().unwrap(),
            ));
            let (timer_tx, timers) = mpsc::unbounded_channel();
            let (heartbeat_tx, heartbeats) = mpsc::unbounded_channel();
            let (events_tx, events) = broadcast::channel(256);
            let registry = DeviceRegistry::new(
                transport,
                timer_tx,
                heartbeat_tx,
                events_tx,
                &ControllerConfig::default(),
            );
            Harness {
                registry,
                link,
                events,
                heartbeats,
                _timers: timers,
            }
        }

        fn announce(&mut self, id: DeviceId, port: u32) {
            let payload = ServiceState { service: 1, port }.encode();
            self.registry
                .on_frame(&inbound(id, 0x5555, STATE_SERVICE, &payload));
        }

        /// Reply to the most recent request, which must be of type `expected`.
        fn answer(&mut self, expected: u16, reply_type: u16, payload: Bytes) {
            let request = self.link.last_frame();
            assert_eq!(request.header.message_type, expected);
            self.registry.on_frame(&inbound(
                request.header.device_id(),
                request.header.source,
                reply_type,
                &payload,
            ));
        }

        fn discover(&mut self, id: DeviceId, label: &str, group: GroupId, group_label: &str) {
            self.announce(id, 56700);
            self.answer(
                GET_LABEL,
                STATE_LABEL,
                LabelPayload {
                    label: label.to_string(),
                }
                .encode(),
            );
            self.answer(
                GET_HOST_FIRMWARE,
                STATE_HOST_FIRMWARE,
                HostFirmwareState {
                    build: 1_500_000_000_000_000_000,
                    minor: 77,
                    major: 2,
                }
                .encode(),
            );
            self.answer(
                GET_WIFI_INFO,
                STATE_WIFI_INFO,
                WifiInfoState { signal: -50.0 }.encode(),
            );
            self.answer(
                GET_VERSION,
                STATE_VERSION,
                VersionState {
                    vendor: 1,
                    product: 27,
                }
                .encode(),
            );
            self.answer(
                GET_GROUP,
                STATE_GROUP,
                GroupState {
                    group,
                    label: group_label.to_string(),
                    updated_at: 1_600_000_000_000_000_000,
                }
                .encode(),
            );
            self.answer(
                GET_COLOR,
                LIGHT_STATE,
                LightState {
                    color: NamedColor::Warm.into(),
                    power: POWER_ON,
                    label: label.to_string(),
                }
                .encode(),
            );
        }

        fn light_events(&mut self) -> Vec<LightEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if !matches!(event, LightEvent::Request(_)) {
                    events.push(event);
                }
            }
            events
        }

        fn request_events(&mut self) -> Vec<RequestEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let LightEvent::Request(event) = event {
                    events.push(event);
                }
            }
            events
        }
    }

    #[tokio::test]
    async fn test_discovery_sequence() {
        let mut h = Harness::new();
        h.announce(kitchen(), 56700);
        assert!(h.registry.device(kitchen()).unwrap().discovery_in_progress());

        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        let sent: Vec<u16> = h
            .link
            .frames()
            .iter()
            .map(|(frame, _)| frame.header.message_type)
            .collect();
        // the second announcement inside discover() must not restart the sequence
        assert_eq!(
            sent,
            vec![
                GET_LABEL,
                GET_HOST_FIRMWARE,
                GET_WIFI_INFO,
                GET_VERSION,
                GET_GROUP,
                GET_COLOR
            ]
        );
    }

    #[tokio::test]
    async fn test_kitchen_discovery() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");

        let events = h.light_events();
        let finished: Vec<&Device> = events
            .iter()
            .filter_map(|event| match event {
                LightEvent::DiscoveryFinished(device) => Some(device),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].label, "Kitchen");
        assert!(!events.iter().any(|event| matches!(
            event,
            LightEvent::LabelChanged(_) | LightEvent::SignalChanged(_) | LightEvent::StateChanged(_)
        )));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, LightEvent::NewGroup { .. }))
                .count(),
            1
        );

        let device = h.registry.device(kitchen()).unwrap();
        assert!(!device.discovery_in_progress());
        assert_eq!(device.socket_addr(), device_addr());
        assert_eq!(device.firmware_version(), "2.77");
        assert_eq!(device.product_id, 27);
        assert_eq!(device.group_id, Some(DOWNSTAIRS));
        assert!(device.is_on());
        assert_eq!(h.registry.devices().len(), 1);
        assert_eq!(h.registry.device_by_label("Kitchen").unwrap().id, kitchen());
        assert_eq!(h.registry.devices_by_product(27).len(), 1);
        assert!(h
            .registry
            .group_by_label("Downstairs")
            .unwrap()
            .contains(kitchen()));
        assert_eq!(h.registry.tracker().pending(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_reply_does_not_fork_discovery() {
        let mut h = Harness::new();
        h.announce(kitchen(), 56700);
        let label = LabelPayload {
            label: "Kitchen".to_string(),
        }
        .encode();
        h.answer(GET_LABEL, STATE_LABEL, label.clone());
        // the same reply delivered twice
        let first_query = h.link.frames()[0].0.clone();
        h.registry.on_frame(&inbound(
            kitchen(),
            first_query.header.source,
            STATE_LABEL,
            &label,
        ));

        let firmware_queries = h
            .link
            .frames()
            .iter()
            .filter(|(frame, _)| frame.header.message_type == GET_HOST_FIRMWARE)
            .count();
        assert_eq!(firmware_queries, 1);
        assert_eq!(h.registry.tracker().pending(), 1);
        assert_eq!(
            h.registry.device(kitchen()).unwrap().discovery,
            Some(DiscoveryStep::HostFirmware)
        );
        assert!(h.light_events().is_empty());
    }

    #[tokio::test]
    async fn test_stray_light_state_does_not_end_discovery() {
        let mut h = Harness::new();
        h.announce(kitchen(), 56700);
        let light = LightState {
            color: NamedColor::Blue.into(),
            power: POWER_ON,
            label: String::new(),
        }
        .encode();
        h.registry
            .on_frame(&inbound(kitchen(), 0x1234, LIGHT_STATE, &light));

        let device = h.registry.device(kitchen()).unwrap();
        assert_eq!(device.discovery, Some(DiscoveryStep::Label));
        assert!(device.is_on());
        assert!(h.light_events().is_empty());
        assert_eq!(h.link.last_frame().header.message_type, GET_LABEL);

        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        let finished = h
            .light_events()
            .iter()
            .filter(|event| matches!(event, LightEvent::DiscoveryFinished(_)))
            .count();
        assert_eq!(finished, 1);
        assert_eq!(h.registry.device(kitchen()).unwrap().product_id, 27);
    }

    #[tokio::test]
    async fn test_duplicate_announcement_is_idempotent() {
        let mut h = Harness::new();
        h.announce(kitchen(), 56700);
        h.announce(kitchen(), 56700);
        assert_eq!(h.registry.devices().len(), 1);
        assert_eq!(h.link.len(), 1);

        h.announce(kitchen(), 56701);
        assert_eq!(h.registry.device(kitchen()).unwrap().port, 56701);
        assert_eq!(h.link.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_service_port_uses_sender_port() {
        let mut h = Harness::new();
        h.announce(kitchen(), 0);
        assert_eq!(h.registry.device(kitchen()).unwrap().port, 56700);
    }

    #[tokio::test]
    async fn test_broadcast_echo_and_unknown_devices_are_ignored() {
        let mut h = Harness::new();
        h.registry
            .on_frame(&inbound(DeviceId::BROADCAST, 1, GET_SERVICE, &[]));
        h.registry.on_frame(&inbound(
            kitchen(),
            1,
            STATE_LABEL,
            &LabelPayload {
                label: "Ghost".to_string(),
            }
            .encode(),
        ));
        h.registry.on_frame(&inbound(kitchen(), 1, 999, &[]));
        assert!(h.registry.devices().is_empty());
        assert_eq!(h.link.len(), 0);
        assert!(h.light_events().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_dropped() {
        let mut h = Harness::new();
        h.announce(kitchen(), 56700);
        h.answer(GET_LABEL, STATE_LABEL, Bytes::from_static(b"short"));
        assert_eq!(h.registry.device(kitchen()).unwrap().label, "");
        assert_eq!(h.link.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_group_state_keeps_one_member() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        let payload = GroupState {
            group: DOWNSTAIRS,
            label: "Downstairs".to_string(),
            updated_at: 1_600_000_000_000_000_000,
        }
        .encode();
        h.registry
            .on_frame(&inbound(kitchen(), 7, STATE_GROUP, &payload));
        h.registry
            .on_frame(&inbound(kitchen(), 8, STATE_GROUP, &payload));
        assert_eq!(h.registry.group(DOWNSTAIRS).unwrap().len(), 1);
        assert_eq!(h.registry.groups().len(), 1);
    }

    #[tokio::test]
    async fn test_device_moves_between_groups() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        h.light_events();

        let payload = GroupState {
            group: UPSTAIRS,
            label: "Upstairs".to_string(),
            updated_at: 1_700_000_000_000_000_000,
        }
        .encode();
        h.registry
            .on_frame(&inbound(kitchen(), 9, STATE_GROUP, &payload));

        assert!(h.registry.group(DOWNSTAIRS).unwrap().is_empty());
        assert!(h.registry.group(UPSTAIRS).unwrap().contains(kitchen()));
        assert_eq!(h.registry.device(kitchen()).unwrap().group_label, "Upstairs");
        let events = h.light_events();
        assert!(events
            .iter()
            .any(|event| matches!(event, LightEvent::NewGroup { id, .. } if *id == UPSTAIRS)));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, LightEvent::GroupChanged(_)))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_set_color_with_ack() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        h.request_events();

        let color = Hsbk::new(21845, 65535, 32768, 3500);
        let handler = h.registry.set_color(kitchen(), color, 500, true).unwrap();
        let (request, destination) = h.link.frames().pop().unwrap();
        assert_eq!(destination, device_addr());
        assert_eq!(request.header.message_type, SET_COLOR);
        assert!(request.header.ack_required);
        assert!(!request.header.res_required);
        assert_eq!(
            SetColor::decode(&request.payload).unwrap(),
            SetColor {
                color,
                duration_ms: 500
            }
        );

        h.registry.on_frame(&inbound(
            kitchen(),
            request.header.source,
            ACKNOWLEDGEMENT,
            &[],
        ));
        assert_eq!(
            h.request_events(),
            vec![
                RequestEvent::Acknowledged { handler },
                RequestEvent::Complete {
                    handler,
                    state: RequestState::Completed
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_set_brightness_keeps_color() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        let warm: Hsbk = NamedColor::Warm.into();

        h.registry.set_brightness(kitchen(), 1000, true).unwrap();
        let request = h.link.last_frame();
        assert_eq!(request.header.message_type, SET_COLOR);
        assert!(request.header.ack_required);
        assert_eq!(
            SetColor::decode(&request.payload).unwrap(),
            SetColor {
                color: warm.with_brightness(1000),
                duration_ms: 0
            }
        );

        h.link.clear();
        assert!(h
            .registry
            .set_brightness(DeviceId::from_mac([9; 6]), 1000, false)
            .is_none());
        assert_eq!(h.link.len(), 0);
    }

    #[tokio::test]
    async fn test_set_color_without_ack_requests_state() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        h.registry
            .set_color(kitchen(), NamedColor::Blue.into(), 0, false)
            .unwrap();
        let request = h.link.last_frame();
        assert!(request.header.res_required);
        assert!(!request.header.ack_required);
    }

    #[tokio::test]
    async fn test_commands_for_unknown_targets() {
        let mut h = Harness::new();
        assert!(h.registry.set_power(kitchen(), true).is_none());
        assert!(h.registry.reboot(kitchen()).is_none());
        assert!(h.registry.set_group_power(DOWNSTAIRS, true).is_empty());
        assert!(!h.registry.enable_heartbeat(kitchen(), Duration::from_secs(5)));
        assert_eq!(h.link.len(), 0);
    }

    #[tokio::test]
    async fn test_group_commands_fan_out() {
        let mut h = Harness::new();
        let hall = DeviceId::from_mac([1, 2, 3, 4, 5, 6]);
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        h.discover(hall, "Hall", DOWNSTAIRS, "Downstairs");
        h.link.clear();

        let handlers = h.registry.set_group_power(DOWNSTAIRS, false);
        assert_eq!(handlers.len(), 2);
        let frames = h.link.frames();
        assert!(frames.iter().all(|(frame, _)| {
            frame.header.message_type == SET_POWER && &frame.payload[..] == [0, 0]
        }));

        h.link.clear();
        let handlers = h.registry.reboot_group(DOWNSTAIRS);
        assert_eq!(handlers.len(), 2);
        assert!(h
            .link
            .frames()
            .iter()
            .all(|(frame, _)| frame.header.message_type == SET_REBOOT
                && frame.header.ack_required));

        assert_eq!(
            h.registry
                .set_group_color(DOWNSTAIRS, NamedColor::Red.into(), 1000)
                .len(),
            2
        );
        assert_eq!(h.registry.refresh_all().len(), 2);
    }

    #[tokio::test]
    async fn test_changes_after_discovery_emit_events() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        h.light_events();

        h.registry
            .on_frame(&inbound(kitchen(), 1, STATE_POWER, &[0, 0]));
        h.registry.on_frame(&inbound(
            kitchen(),
            2,
            STATE_LABEL,
            &LabelPayload {
                label: "Pantry".to_string(),
            }
            .encode(),
        ));
        h.registry.on_frame(&inbound(
            kitchen(),
            3,
            STATE_WIFI_INFO,
            &WifiInfoState { signal: -70.0 }.encode(),
        ));
        let events = h.light_events();
        assert!(matches!(&events[0], LightEvent::PowerChanged(device) if !device.is_on()));
        assert!(matches!(&events[1], LightEvent::LabelChanged(device) if device.label == "Pantry"));
        assert!(matches!(&events[2], LightEvent::SignalChanged(device) if device.signal == -70.0));
    }

    #[tokio::test]
    async fn test_power_during_discovery_is_silent() {
        let mut h = Harness::new();
        h.announce(kitchen(), 56700);
        h.registry
            .on_frame(&inbound(kitchen(), 1, STATE_POWER, &[0xff, 0xff]));
        assert!(h.registry.device(kitchen()).unwrap().is_on());
        assert!(h.light_events().is_empty());
    }

    #[tokio::test]
    async fn test_echo_nonce_matching() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        h.light_events();

        h.registry.on_heartbeat(kitchen());
        let request = h.link.last_frame();
        assert_eq!(request.header.message_type, ECHO_REQUEST);
        let nonce = EchoPayload::decode(&request.payload).unwrap().nonce;
        assert!(h.registry.device(kitchen()).unwrap().heartbeat_pending);

        let wrong = EchoPayload {
            nonce: nonce.wrapping_add(1),
        }
        .encode();
        h.registry
            .on_frame(&inbound(kitchen(), request.header.source, ECHO_REPLY, &wrong));
        assert!(h.light_events().is_empty());
        assert!(h.registry.device(kitchen()).unwrap().heartbeat_pending);

        let right = EchoPayload { nonce }.encode();
        h.registry
            .on_frame(&inbound(kitchen(), request.header.source, ECHO_REPLY, &right));
        let events = h.light_events();
        assert!(matches!(events.as_slice(), [LightEvent::EchoOk(_)]));
        assert!(!h.registry.device(kitchen()).unwrap().heartbeat_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks() {
        let mut h = Harness::new();
        h.announce(kitchen(), 56700);
        assert!(!h.registry.enable_heartbeat(kitchen(), Duration::from_millis(500)));
        assert!(h.registry.enable_heartbeat(kitchen(), Duration::from_secs(2)));

        let start = Instant::now();
        assert_eq!(h.heartbeats.recv().await, Some(kitchen()));
        assert!(start.elapsed() >= Duration::from_secs(2));

        assert!(h.registry.disable_heartbeat(kitchen()));
        assert!(!h.registry.disable_heartbeat(kitchen()));
        assert!(
            tokio::time::timeout(Duration::from_secs(10), h.heartbeats.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_product_capabilities() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        assert!(h.registry.device(kitchen()).unwrap().capabilities.is_none());

        let table: HashMap<u32, ProductCapabilities> = serde_json::from_str(
            r#"{ "27": { "name": "LIFX A19", "color": true, "min_kelvin": 2500, "max_kelvin": 9000 } }"#,
        )
        .unwrap();
        h.registry.set_product_capabilities(table);
        assert_eq!(
            h.registry
                .device(kitchen())
                .unwrap()
                .capabilities
                .as_ref()
                .unwrap()
                .name,
            "LIFX A19"
        );

        let hall = DeviceId::from_mac([1, 2, 3, 4, 5, 6]);
        h.discover(hall, "Hall", DOWNSTAIRS, "Downstairs");
        assert!(h.registry.device(hall).unwrap().capabilities.is_some());
    }

    #[tokio::test]
    async fn test_cancel_and_set_label() {
        let mut h = Harness::new();
        h.discover(kitchen(), "Kitchen", DOWNSTAIRS, "Downstairs");
        let handler = h.registry.set_label(kitchen(), "Pantry").unwrap();
        let request = h.link.last_frame();
        assert_eq!(
            LabelPayload::decode(&request.payload).unwrap().label,
            "Pantry"
        );
        assert!(h.registry.cancel(handler));
        assert!(!h.registry.tracker().is_active(handler));
        h.request_events();

        // a late reply to a cancelled request is only applied as state
        h.registry.on_frame(&inbound(
            kitchen(),
            request.header.source,
            STATE_LABEL,
            &LabelPayload {
                label: "Pantry".to_string(),
            }
            .encode(),
        ));
        assert!(h.request_events().is_empty());
        assert_eq!(h.registry.device(kitchen()).unwrap().label, "Pantry");
    }

    #[tokio::test]
    async fn test_discover_by_address_is_tracked() {
        let mut h = Harness::new();
        let address: SocketAddr = "192.168.1.77:56700".parse().unwrap();
        let handler = h.registry.discover_by_address(address);
        let (request, destination) = h.link.frames().pop().unwrap();
        assert_eq!(destination, address);
        assert!(request.header.tagged);
        assert!(h.registry.tracker().is_active(handler));

        h.registry.on_frame(&inbound(
            kitchen(),
            request.header.source,
            STATE_SERVICE,
            &ServiceState {
                service: 1,
                port: 56700,
            }
            .encode(),
        ));
        assert!(!h.registry.tracker().is_active(handler));
        assert!(h.registry.device(kitchen()).is_some());
    }
}
