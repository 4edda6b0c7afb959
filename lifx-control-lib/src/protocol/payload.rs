//! Payload layouts for the messages this library sends and understands.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::led::hsbk::Hsbk;
use crate::protocol::{DecodeError, GroupId};

/// Width of every label field on the wire.
pub const LABEL_SIZE: usize = 32;

pub const POWER_ON: u16 = 0xffff;
pub const POWER_OFF: u16 = 0;

/// A fixed size message payload.
pub trait WirePayload: Sized {
    /// Number of bytes the payload occupies on the wire.
    const SIZE: usize;

    fn encode(&self) -> Bytes;

    fn decode(payload: &[u8]) -> Result<Self, DecodeError>;
}

fn check_len(name: &'static str, payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() < expected {
        return Err(DecodeError::PayloadTooShort {
            name,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Reads a NUL padded label, replacing invalid UTF-8.
pub fn decode_label(raw: &[u8]) -> String {
    let raw = &raw[..raw.len().min(LABEL_SIZE)];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Writes a label padded with NULs, truncated on a char boundary if it is too long.
pub fn encode_label(label: &str, buf: &mut BytesMut) {
    let mut end = label.len().min(LABEL_SIZE);
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_slice(&label.as_bytes()[..end]);
    buf.put_bytes(0, LABEL_SIZE - end);
}

fn get_hsbk(buf: &mut &[u8]) -> Hsbk {
    Hsbk {
        hue: buf.get_u16_le(),
        saturation: buf.get_u16_le(),
        brightness: buf.get_u16_le(),
        kelvin: buf.get_u16_le(),
    }
}

fn put_hsbk(color: &Hsbk, buf: &mut BytesMut) {
    buf.put_u16_le(color.hue);
    buf.put_u16_le(color.saturation);
    buf.put_u16_le(color.brightness);
    buf.put_u16_le(color.kelvin);
}

/// Reply to a service query, announcing a device and the port it listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceState {
    pub service: u8,
    pub port: u32,
}

impl WirePayload for ServiceState {
    const SIZE: usize = 5;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(self.service);
        buf.put_u32_le(self.port);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("ServiceState", payload, Self::SIZE)?;
        let mut buf = payload;
        Ok(ServiceState {
            service: buf.get_u8(),
            port: buf.get_u32_le(),
        })
    }
}

/// Full light state: color, power and label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightState {
    pub color: Hsbk,
    pub power: u16,
    pub label: String,
}

impl WirePayload for LightState {
    const SIZE: usize = 52;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        put_hsbk(&self.color, &mut buf);
        buf.put_u16_le(0);
        buf.put_u16_le(self.power);
        encode_label(&self.label, &mut buf);
        buf.put_u64_le(0);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("LightState", payload, Self::SIZE)?;
        let mut buf = payload;
        let color = get_hsbk(&mut buf);
        buf.advance(2);
        let power = buf.get_u16_le();
        let label = decode_label(&buf[..LABEL_SIZE]);
        Ok(LightState {
            color,
            power,
            label,
        })
    }
}

/// Host firmware details. `build` is a nanosecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFirmwareState {
    pub build: u64,
    pub minor: u16,
    pub major: u16,
}

impl WirePayload for HostFirmwareState {
    const SIZE: usize = 20;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.build);
        buf.put_u64_le(0);
        buf.put_u16_le(self.minor);
        buf.put_u16_le(self.major);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("HostFirmwareState", payload, Self::SIZE)?;
        let mut buf = payload;
        let build = buf.get_u64_le();
        buf.advance(8);
        Ok(HostFirmwareState {
            build,
            minor: buf.get_u16_le(),
            major: buf.get_u16_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionState {
    pub vendor: u32,
    pub product: u32,
}

impl WirePayload for VersionState {
    const SIZE: usize = 12;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.vendor);
        buf.put_u32_le(self.product);
        buf.put_u32_le(0);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("VersionState", payload, Self::SIZE)?;
        let mut buf = payload;
        Ok(VersionState {
            vendor: buf.get_u32_le(),
            product: buf.get_u32_le(),
        })
    }
}

/// Group membership reported by a device. `updated_at` is nanoseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub group: GroupId,
    pub label: String,
    pub updated_at: u64,
}

impl WirePayload for GroupState {
    const SIZE: usize = 56;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&self.group.0);
        encode_label(&self.label, &mut buf);
        buf.put_u64_le(self.updated_at);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("GroupState", payload, Self::SIZE)?;
        let mut group = [0u8; 16];
        group.copy_from_slice(&payload[..16]);
        let label = decode_label(&payload[16..16 + LABEL_SIZE]);
        let mut buf = &payload[16 + LABEL_SIZE..];
        Ok(GroupState {
            group: GroupId(group),
            label,
            updated_at: buf.get_u64_le(),
        })
    }
}

/// Power level for set-power and state-power. Devices only use 0 and 65535.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerLevel {
    pub level: u16,
}

impl PowerLevel {
    pub fn from_on(on: bool) -> Self {
        PowerLevel {
            level: if on { POWER_ON } else { POWER_OFF },
        }
    }

    pub fn is_on(&self) -> bool {
        self.level != POWER_OFF
    }
}

impl WirePayload for PowerLevel {
    const SIZE: usize = 2;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u16_le(self.level);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("PowerLevel", payload, Self::SIZE)?;
        let mut buf = payload;
        Ok(PowerLevel {
            level: buf.get_u16_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WifiInfoState {
    pub signal: f32,
}

impl WirePayload for WifiInfoState {
    const SIZE: usize = 4;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_f32_le(self.signal);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("WifiInfoState", payload, Self::SIZE)?;
        let mut buf = payload;
        Ok(WifiInfoState {
            signal: buf.get_f32_le(),
        })
    }
}

/// Echo request and reply share the same nonce payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoPayload {
    pub nonce: u64,
}

impl WirePayload for EchoPayload {
    const SIZE: usize = 8;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.nonce);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("EchoPayload", payload, Self::SIZE)?;
        let mut buf = payload;
        Ok(EchoPayload {
            nonce: buf.get_u64_le(),
        })
    }
}

/// Set-color command. The transition takes `duration_ms` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetColor {
    pub color: Hsbk,
    pub duration_ms: u32,
}

impl WirePayload for SetColor {
    const SIZE: usize = 13;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(0);
        put_hsbk(&self.color, &mut buf);
        buf.put_u32_le(self.duration_ms);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("SetColor", payload, Self::SIZE)?;
        let mut buf = payload;
        buf.advance(1);
        let color = get_hsbk(&mut buf);
        Ok(SetColor {
            color,
            duration_ms: buf.get_u32_le(),
        })
    }
}

/// Used by both state-label and set-label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPayload {
    pub label: String,
}

impl WirePayload for LabelPayload {
    const SIZE: usize = LABEL_SIZE;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        encode_label(&self.label, &mut buf);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        check_len("LabelPayload", payload, Self::SIZE)?;
        Ok(LabelPayload {
            label: decode_label(payload),
        })
    }
}
