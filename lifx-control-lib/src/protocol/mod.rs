//! Wire codec for the LIFX LAN protocol.
//!
//! Every message is a fixed 36 byte header followed by a message specific payload.
//! All multi-byte fields are little-endian. The header packs several flags into
//! bit fields, which are encoded here with explicit shifts and masks so the layout
//! is identical on every platform.
//!
//! ```
//! use lifx_control_lib::protocol::{decode, encode, message_type, FrameHeader};
//!
//! let header = FrameHeader::discovery(0x1234);
//! let datagram = encode(&header, &[]);
//! let frame = decode(&datagram).unwrap();
//! assert_eq!(frame.header.message_type, message_type::GET_SERVICE);
//! assert!(frame.header.tagged);
//! ```

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod payload;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 36;

/// Protocol number carried in every header. Anything else is rejected.
pub const PROTOCOL_NUMBER: u16 = 1024;

/// The UDP port devices listen on.
pub const LIFX_PORT: u16 = 56700;

/// Written into the reserved bytes after the target, the way the official clients do.
const PROTOCOL_MARKER: [u8; 6] = *b"LIFXV2";

const PROTOCOL_MASK: u16 = 0x0fff;
const ADDRESSABLE_BIT: u16 = 1 << 12;
const TAGGED_BIT: u16 = 1 << 13;
const ORIGIN_SHIFT: u16 = 14;
const RES_REQUIRED_BIT: u8 = 0b01;
const ACK_REQUIRED_BIT: u8 = 0b10;

/// Message type numbers used by this library.
pub mod message_type {
    pub const GET_SERVICE: u16 = 2;
    pub const STATE_SERVICE: u16 = 3;
    pub const GET_HOST_FIRMWARE: u16 = 14;
    pub const STATE_HOST_FIRMWARE: u16 = 15;
    pub const GET_WIFI_INFO: u16 = 16;
    pub const STATE_WIFI_INFO: u16 = 17;
    pub const GET_POWER: u16 = 20;
    pub const SET_POWER: u16 = 21;
    pub const STATE_POWER: u16 = 22;
    pub const GET_LABEL: u16 = 23;
    pub const SET_LABEL: u16 = 24;
    pub const STATE_LABEL: u16 = 25;
    pub const GET_VERSION: u16 = 32;
    pub const STATE_VERSION: u16 = 33;
    pub const SET_REBOOT: u16 = 38;
    pub const ACKNOWLEDGEMENT: u16 = 45;
    pub const GET_GROUP: u16 = 51;
    pub const STATE_GROUP: u16 = 53;
    pub const ECHO_REQUEST: u16 = 58;
    pub const ECHO_REPLY: u16 = 59;
    pub const GET_COLOR: u16 = 101;
    pub const SET_COLOR: u16 = 102;
    pub const LIGHT_STATE: u16 = 107;
}

/// Human readable name of a message type, for log output.
pub fn message_name(message_type: u16) -> &'static str {
    use message_type::*;
    match message_type {
        GET_SERVICE => "GET_SERVICE",
        STATE_SERVICE => "STATE_SERVICE",
        GET_HOST_FIRMWARE => "GET_HOST_FIRMWARE",
        STATE_HOST_FIRMWARE => "STATE_HOST_FIRMWARE",
        GET_WIFI_INFO => "GET_WIFI_INFO",
        STATE_WIFI_INFO => "STATE_WIFI_INFO",
        GET_POWER => "GET_POWER",
        SET_POWER => "SET_POWER",
        STATE_POWER => "STATE_POWER",
        GET_LABEL => "GET_LABEL",
        SET_LABEL => "SET_LABEL",
        STATE_LABEL => "STATE_LABEL",
        GET_VERSION => "GET_VERSION",
        STATE_VERSION => "STATE_VERSION",
        SET_REBOOT => "SET_REBOOT",
        ACKNOWLEDGEMENT => "ACKNOWLEDGEMENT",
        GET_GROUP => "GET_GROUP",
        STATE_GROUP => "STATE_GROUP",
        ECHO_REQUEST => "ECHO_REQUEST",
        ECHO_REPLY => "ECHO_REPLY",
        GET_COLOR => "GET_COLOR",
        SET_COLOR => "SET_COLOR",
        LIGHT_STATE => "LIGHT_STATE",
        _ => "UNKNOWN",
    }
}

/// Reasons a datagram or payload is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram of {0} bytes is shorter than the 36 byte header")]
    TooShort(usize),

    #[error("unexpected protocol number {0}")]
    BadProtocol(u16),

    #[error("message type is zero")]
    ZeroMessageType,

    #[error("size field {declared} does not fit a datagram of {actual} bytes")]
    BadSize { declared: usize, actual: usize },

    #[error("{name} payload needs {expected} bytes, got {actual}")]
    PayloadTooShort {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// The 8 byte target field of a frame, which is the device's hardware address
/// padded with two zero bytes. Read as a little-endian `u64` it is the key used
/// everywhere to identify a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// The all zero target, which addresses every device.
    pub const BROADCAST: DeviceId = DeviceId(0);

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        DeviceId(u64::from_le_bytes(bytes))
    }

    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&mac);
        Self::from_bytes(bytes)
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

/// Formats the first six bytes as a MAC address.
impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        )
    }
}

impl FromStr for DeviceId {
    type Err = anyhow::Error;

    /// Parses `aa:bb:cc:dd:ee:ff`, optionally followed by the two padding bytes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 && parts.len() != 8 {
            bail!("Invalid device address: {}", s);
        }
        let mut bytes = [0u8; 8];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| anyhow!("Invalid device address: {}", s))?;
        }
        Ok(DeviceId::from_bytes(bytes))
    }
}

/// Opaque 16 byte group identifier assigned by the devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub [u8; 16]);

/// Group ids are UUIDs in practice, so they are shown that way.
impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).hyphenated())
    }
}

/// The decoded header fields of a frame.
///
/// `size` and `protocol` are not stored: the size is always computed from the
/// payload and the protocol number is a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tagged: bool,
    pub addressable: bool,
    pub origin: u8,
    /// Correlation id. Devices copy it into every reply.
    pub source: u32,
    pub target: u64,
    pub res_required: bool,
    pub ack_required: bool,
    pub sequence: u8,
    pub message_type: u16,
}

impl FrameHeader {
    /// An untargeted, untagged header for the given message type.
    pub fn new(message_type: u16) -> Self {
        FrameHeader {
            tagged: false,
            addressable: true,
            origin: 0,
            source: 0,
            target: 0,
            res_required: false,
            ack_required: false,
            sequence: 0,
            message_type,
        }
    }

    /// A tagged GET_SERVICE header, answered by every device that receives it.
    pub fn discovery(source: u32) -> Self {
        FrameHeader {
            tagged: true,
            source,
            ..Self::new(message_type::GET_SERVICE)
        }
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId(self.target)
    }
}

/// A validated frame: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Value of the size field on the wire.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn message_type(&self) -> u16 {
        self.header.message_type
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let header = &self.header;
        write!(
            f,
            "{}({}) size={} source={:08x} target={} seq={} tagged={} ack={} res={}",
            message_name(header.message_type),
            header.message_type,
            self.size(),
            header.source,
            header.device_id(),
            header.sequence,
            header.tagged,
            header.ack_required,
            header.res_required,
        )?;
        if !self.payload.is_empty() {
            write!(f, " payload={}", hex::encode(&self.payload))?;
        }
        Ok(())
    }
}

/// Serializes a header and payload into a datagram.
pub fn encode(header: &FrameHeader, payload: &[u8]) -> Bytes {
    let size = HEADER_SIZE + payload.len();
    let mut packet = BytesMut::with_capacity(size);

    packet.put_u16_le(size as u16);

    let mut protocol = PROTOCOL_NUMBER & PROTOCOL_MASK;
    if header.addressable {
        protocol |= ADDRESSABLE_BIT;
    }
    if header.tagged {
        protocol |= TAGGED_BIT;
    }
    protocol |= (u16::from(header.origin) & 0b11) << ORIGIN_SHIFT;
    packet.put_u16_le(protocol);

    packet.put_u32_le(header.source);
    packet.put_u64_le(header.target);
    packet.put_slice(&PROTOCOL_MARKER);

    let mut address_flags = 0u8;
    if header.res_required {
        address_flags |= RES_REQUIRED_BIT;
    }
    if header.ack_required {
        address_flags |= ACK_REQUIRED_BIT;
    }
    packet.put_u8(address_flags);
    packet.put_u8(header.sequence);

    packet.put_u64_le(0);
    packet.put_u16_le(header.message_type);
    packet.put_u16_le(0);

    packet.extend_from_slice(payload);
    packet.freeze()
}

/// Parses and validates a datagram.
///
/// The protocol number and message type are checked before any other field is
/// exposed. Bytes beyond the size declared in the header are ignored.
pub fn decode(datagram: &[u8]) -> Result<Frame, DecodeError> {
    if datagram.len() < HEADER_SIZE {
        return Err(DecodeError::TooShort(datagram.len()));
    }
    let mut buf = datagram;

    let size = usize::from(buf.get_u16_le());
    let protocol = buf.get_u16_le();
    if protocol & PROTOCOL_MASK != PROTOCOL_NUMBER {
        return Err(DecodeError::BadProtocol(protocol & PROTOCOL_MASK));
    }
    let message_type = u16::from_le_bytes([datagram[32], datagram[33]]);
    if message_type == 0 {
        return Err(DecodeError::ZeroMessageType);
    }
    if size < HEADER_SIZE || size > datagram.len() {
        return Err(DecodeError::BadSize {
            declared: size,
            actual: datagram.len(),
        });
    }

    let source = buf.get_u32_le();
    let target = buf.get_u64_le();
    buf.advance(PROTOCOL_MARKER.len());
    let address_flags = buf.get_u8();
    let sequence = buf.get_u8();

    let header = FrameHeader {
        tagged: protocol & TAGGED_BIT != 0,
        addressable: protocol & ADDRESSABLE_BIT != 0,
        origin: (protocol >> ORIGIN_SHIFT) as u8 & 0b11,
        source,
        target,
        res_required: address_flags & RES_REQUIRED_BIT != 0,
        ack_required: address_flags & ACK_REQUIRED_BIT != 0,
        sequence,
        message_type,
    };

    Ok(Frame {
        header,
        payload: Bytes::copy_from_slice(&datagram[HEADER_SIZE..size]),
    })
}
