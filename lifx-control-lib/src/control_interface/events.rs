use crate::control_interface::device::{Device, Group};
use crate::protocol::GroupId;
use crate::util::tracker::RequestEvent;

/// Notifications published by the registry. Device and group payloads are
/// snapshots taken when the event was emitted.
#[derive(Debug, Clone)]
pub enum LightEvent {
    /// The discovery sequence for a device finished. Sent once per device.
    DiscoveryFinished(Device),
    LabelChanged(Device),
    SignalChanged(Device),
    StateChanged(Device),
    PowerChanged(Device),
    NewGroup { id: GroupId, label: String },
    GroupChanged(Group),
    /// A heartbeat echo came back with the expected nonce.
    EchoOk(Device),
    /// Progress of a tracked request.
    Request(RequestEvent),
}

impl LightEvent {
    /// The device this event is about, if any.
    pub fn device(&self) -> Option<&Device> {
        match self {
            LightEvent::DiscoveryFinished(device)
            | LightEvent::LabelChanged(device)
            | LightEvent::SignalChanged(device)
            | LightEvent::StateChanged(device)
            | LightEvent::PowerChanged(device)
            | LightEvent::EchoOk(device) => Some(device),
            _ => None,
        }
    }
}
