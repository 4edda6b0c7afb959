use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use derivative::Derivative;
use palette::Srgb;
use serde::{Deserialize, Serialize};

use crate::led::hsbk::Hsbk;
use crate::protocol::payload::POWER_OFF;
use crate::protocol::{message_type, DeviceId, GroupId};

/// What a product can do, looked up by product id in an external table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductCapabilities {
    pub name: String,
    pub color: bool,
    pub chain: bool,
    pub matrix: bool,
    pub infrared: bool,
    pub multizone: bool,
    pub min_kelvin: u16,
    pub max_kelvin: u16,
}

impl Default for ProductCapabilities {
    fn default() -> Self {
        ProductCapabilities {
            name: String::new(),
            color: true,
            chain: false,
            matrix: false,
            infrared: false,
            multizone: false,
            min_kelvin: 2500,
            max_kelvin: 9000,
        }
    }
}

/// One step of the per-device discovery sequence, in the order they are queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscoveryStep {
    Label,
    HostFirmware,
    WifiInfo,
    Version,
    Group,
    LightState,
}

impl DiscoveryStep {
    /// The query whose reply completes this step.
    pub fn query(self) -> u16 {
        match self {
            DiscoveryStep::Label => message_type::GET_LABEL,
            DiscoveryStep::HostFirmware => message_type::GET_HOST_FIRMWARE,
            DiscoveryStep::WifiInfo => message_type::GET_WIFI_INFO,
            DiscoveryStep::Version => message_type::GET_VERSION,
            DiscoveryStep::Group => message_type::GET_GROUP,
            DiscoveryStep::LightState => message_type::GET_COLOR,
        }
    }

    /// `None` once the light state has arrived.
    pub fn next(self) -> Option<Self> {
        match self {
            DiscoveryStep::Label => Some(DiscoveryStep::HostFirmware),
            DiscoveryStep::HostFirmware => Some(DiscoveryStep::WifiInfo),
            DiscoveryStep::WifiInfo => Some(DiscoveryStep::Version),
            DiscoveryStep::Version => Some(DiscoveryStep::Group),
            DiscoveryStep::Group => Some(DiscoveryStep::LightState),
            DiscoveryStep::LightState => None,
        }
    }
}

/**
 * A bulb as last reported by the network.
 *
 * Devices are created when they first announce themselves and filled in by the
 * discovery sequence. Equality ignores the values that change on their own
 * (signal strength and heartbeat bookkeeping).
 */
#[derive(Derivative)]
#[derivative(PartialEq)]
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub address: IpAddr,
    pub port: u16,
    pub service: u8,
    pub label: String,
    pub power: u16,
    pub color: Hsbk,
    pub firmware_major: u16,
    pub firmware_minor: u16,
    /// Firmware build time, nanoseconds since the epoch.
    pub firmware_build: u64,
    pub vendor_id: u32,
    pub product_id: u32,
    pub capabilities: Option<ProductCapabilities>,
    pub group_id: Option<GroupId>,
    pub group_label: String,

    #[derivative(PartialEq = "ignore")]
    pub signal: f32,

    /**
    The discovery reply this device is waiting for, from the first service
    announcement until the light state arrives.

    Only the reply for this step advances the sequence. Other replies update the
    device without producing change events.
    */
    pub discovery: Option<DiscoveryStep>,

    #[derivative(PartialEq = "ignore")]
    pub heartbeat_pending: bool,
    #[derivative(PartialEq = "ignore")]
    pub last_echo_nonce: u64,
}

impl Device {
    pub fn new(id: DeviceId, address: SocketAddr, service: u8) -> Self {
        Device {
            id,
            address: address.ip(),
            port: address.port(),
            service,
            label: String::new(),
            power: POWER_OFF,
            color: Hsbk::default(),
            firmware_major: 0,
            firmware_minor: 0,
            firmware_build: 0,
            vendor_id: 0,
            product_id: 0,
            capabilities: None,
            group_id: None,
            group_label: String::new(),
            signal: 0.0,
            discovery: None,
            heartbeat_pending: false,
            last_echo_nonce: 0,
        }
    }

    pub fn discovery_in_progress(&self) -> bool {
        self.discovery.is_some()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn is_on(&self) -> bool {
        self.power != POWER_OFF
    }

    pub fn firmware_version(&self) -> String {
        format!("{}.{}", self.firmware_major, self.firmware_minor)
    }

    pub fn firmware_built_at(&self) -> Option<DateTime<Utc>> {
        nanos_to_datetime(self.firmware_build)
    }

    /// Approximate RGB of the current color. Kelvin is not represented.
    pub fn rgb(&self) -> Srgb<u8> {
        self.color.to_srgb()
    }
}

impl From<&Device> for DeviceId {
    fn from(device: &Device) -> Self {
        device.id
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {} firmware {} {}",
            if self.label.is_empty() { "?" } else { self.label.as_str() },
            self.id,
            self.socket_addr(),
            self.firmware_version(),
            if self.is_on() { "ON" } else { "OFF" }
        )
    }
}

/// A named set of devices, as reported by the devices themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: GroupId,
    pub label: String,
    /// Last change, nanoseconds since the epoch.
    pub updated_at: u64,
    members: Vec<DeviceId>,
}

impl Group {
    pub fn new(id: GroupId, label: String, updated_at: u64) -> Self {
        Group {
            id,
            label,
            updated_at,
            members: Vec::new(),
        }
    }

    /// Member ids in the order they joined.
    pub fn members(&self) -> &[DeviceId] {
        &self.members
    }

    pub fn contains(&self, device: DeviceId) -> bool {
        self.members.contains(&device)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn updated_at_time(&self) -> Option<DateTime<Utc>> {
        nanos_to_datetime(self.updated_at)
    }

    /// Adds a member unless it is already present.
    /// # Returns
    /// Whether the device was added.
    pub(crate) fn add(&mut self, device: DeviceId) -> bool {
        if self.contains(device) {
            return false;
        }
        self.members.push(device);
        true
    }

    pub(crate) fn remove(&mut self, device: DeviceId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| *member != device);
        self.members.len() != before
    }
}

fn nanos_to_datetime(nanos: u64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        return None;
    }
    let secs = i64::try_from(nanos / 1_000_000_000).ok()?;
    DateTime::from_timestamp(secs, (nanos % 1_000_000_000) as u32)
}
