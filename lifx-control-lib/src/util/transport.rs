//! UDP transport: one socket, fire-and-forget sends and a receive task that
//! forwards decoded frames to the event loop.
//!
//! Sends are queued to a writer task that owns the async `send_to`, so callers
//! never wait on the socket and a datagram is never lost to a socket that has not
//! reported write readiness yet.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::protocol::{decode, encode, message_name, DeviceId, Frame, FrameHeader};
use crate::util::config::ControllerConfig;
use crate::util::traits::DatagramLink;

/// Correlation id placed in the `source` field. Devices echo it back.
pub type CorrelationId = u32;

/// Larger than any frame a device sends.
const RECEIVE_BUFFER_SIZE: usize = 1024;

/// Datagrams waiting for the writer task.
const SEND_QUEUE_CAPACITY: usize = 256;

/// Pause after a receive error so a persistent failure does not spin.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// A valid frame together with the address it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub frame: Frame,
    pub sender: SocketAddr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    pub ack_required: bool,
    pub res_required: bool,
}

impl SendFlags {
    pub fn ack() -> Self {
        SendFlags {
            ack_required: true,
            res_required: false,
        }
    }

    pub fn response() -> Self {
        SendFlags {
            ack_required: false,
            res_required: true,
        }
    }
}

/// Everything needed to put a request on the wire except the correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub destination: SocketAddr,
    pub target: Option<DeviceId>,
    pub tagged: bool,
    pub message_type: u16,
    pub payload: Bytes,
    pub flags: SendFlags,
}

impl OutboundRequest {
    /// A request addressed to one device.
    pub fn targeted(destination: SocketAddr, target: DeviceId, message_type: u16) -> Self {
        OutboundRequest {
            destination,
            target: Some(target),
            tagged: false,
            message_type,
            payload: Bytes::new(),
            flags: SendFlags::default(),
        }
    }

    /// A tagged service query. Every device that receives it answers.
    pub fn discovery(destination: SocketAddr) -> Self {
        OutboundRequest {
            destination,
            target: None,
            tagged: true,
            message_type: crate::protocol::message_type::GET_SERVICE,
            payload: Bytes::new(),
            flags: SendFlags::default(),
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_flags(mut self, flags: SendFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A fresh random correlation id. Zero is never returned.
pub fn new_correlation_id() -> CorrelationId {
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/**
 * Builds frames and hands them to a [`DatagramLink`].
 *
 * Sends never block and never retry. A datagram the link refuses is logged and
 * dropped; retrying is the job of the request tracker.
 */
pub struct Transport {
    link: Arc<dyn DatagramLink>,
    broadcast: SocketAddr,
    sequence: AtomicU8,
}

impl Transport {
    pub fn new(link: Arc<dyn DatagramLink>, broadcast: SocketAddr) -> Self {
        Transport {
            link,
            broadcast,
            sequence: AtomicU8::new(0),
        }
    }

    pub fn broadcast_address(&self) -> SocketAddr {
        self.broadcast
    }

    /// Broadcast a tagged service query with a fresh correlation id.
    pub fn broadcast_discovery(&self) -> CorrelationId {
        let source = new_correlation_id();
        self.send_request(&OutboundRequest::discovery(self.broadcast), source);
        source
    }

    /// Send one unicast message with a fresh correlation id.
    pub fn send_to(
        &self,
        destination: SocketAddr,
        target: DeviceId,
        message_type: u16,
        payload: Bytes,
        flags: SendFlags,
    ) -> CorrelationId {
        let source = new_correlation_id();
        let request = OutboundRequest::targeted(destination, target, message_type)
            .with_payload(payload)
            .with_flags(flags);
        self.send_request(&request, source);
        source
    }

    /// Encode and send a request with the given correlation id.
    /// # Returns
    /// The datagram as sent, so it can be resent unchanged.
    pub fn send_request(&self, request: &OutboundRequest, source: CorrelationId) -> Bytes {
        let header = FrameHeader {
            tagged: request.tagged,
            source,
            target: request.target.map(|id| id.0).unwrap_or(0),
            ack_required: request.flags.ack_required,
            res_required: request.flags.res_required,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            ..FrameHeader::new(request.message_type)
        };
        let datagram = encode(&header, &request.payload);
        debug!(
            "Sending {} to {} (source {:08x}, seq {})",
            message_name(request.message_type),
            request.destination,
            source,
            header.sequence
        );
        self.resend(&datagram, request.destination);
        datagram
    }

    /// Put an already encoded datagram on the wire.
    pub fn resend(&self, datagram: &[u8], destination: SocketAddr) {
        match self.link.send_datagram(datagram, destination) {
            Ok(queued) => trace!(
                "Queued {} bytes for {}: {}",
                queued,
                destination,
                hex::encode(datagram)
            ),
            Err(e) => warn!("Dropping datagram to {}: {}", destination, e),
        }
    }
}

/// The bound socket. Cloning the inner `Arc` is how sending and receiving share it.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind the socket described by `config` and enable broadcast.
    ///
    /// Failure here is fatal for the caller; it is not retried.
    pub async fn bind(config: &ControllerConfig) -> Result<Self> {
        let addr = config.bind_socket_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {}", addr))?;
        socket
            .set_broadcast(true)
            .context("Failed to enable broadcast on UDP socket")?;
        let local_addr = socket
            .local_addr()
            .context("Failed to read local address of UDP socket")?;
        info!("Listening on {}", local_addr);
        Ok(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A sending [`Transport`] on this socket.
    ///
    /// Starts the writer task, which runs until the returned transport is dropped.
    pub fn transport(&self, broadcast: SocketAddr) -> Transport {
        let (outgoing, queue) = mpsc::channel(SEND_QUEUE_CAPACITY);
        tokio::spawn(send_loop(self.socket.clone(), queue));
        Transport::new(Arc::new(SocketLink { outgoing }), broadcast)
    }

    /// Start the receive task. It stops when `frames` is closed.
    ///
    /// Frames that arrive while `frames` is full are dropped.
    pub fn spawn_receiver(&self, frames: mpsc::Sender<InboundFrame>) -> JoinHandle<()> {
        tokio::spawn(receive_loop(self.socket.clone(), frames))
    }
}

/// The link a [`UdpTransport`] hands out: a queue in front of the writer task.
struct SocketLink {
    outgoing: mpsc::Sender<(Bytes, SocketAddr)>,
}

impl DatagramLink for SocketLink {
    fn send_datagram(&self, datagram: &[u8], destination: SocketAddr) -> io::Result<usize> {
        match self
            .outgoing
            .try_send((Bytes::copy_from_slice(datagram), destination))
        {
            Ok(()) => Ok(datagram.len()),
            Err(TrySendError::Full(_)) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "send queue is full",
            )),
            Err(TrySendError::Closed(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "socket writer has stopped",
            )),
        }
    }
}

async fn send_loop(socket: Arc<UdpSocket>, mut queue: mpsc::Receiver<(Bytes, SocketAddr)>) {
    while let Some((datagram, destination)) = queue.recv().await {
        match socket.send_to(&datagram, destination).await {
            Ok(sent) => trace!("Sent {} bytes to {}", sent, destination),
            Err(e) => error!("Failed to send datagram to {}: {}", destination, e),
        }
    }
    debug!("Send queue closed, stopping writer");
}

async fn receive_loop(socket: Arc<UdpSocket>, frames: mpsc::Sender<InboundFrame>) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    loop {
        let (len, sender) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("Failed to receive datagram: {}", e);
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };
        let datagram = &buf[..len];
        trace!("Received {} bytes from {}: {}", len, sender, hex::encode(datagram));

        let frame = match decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", sender, e);
                continue;
            }
        };
        match frames.try_send(InboundFrame { frame, sender }) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => warn!(
                "Receive queue full, dropping {} from {}",
                message_name(dropped.frame.message_type()),
                dropped.sender
            ),
            Err(TrySendError::Closed(_)) => {
                debug!("Frame channel closed, stopping receiver");
                break;
            }
        }
    }
}
