use std::io;
use std::net::SocketAddr;

/// Something that can put a datagram on the wire.
///
/// Frame building and correlation only ever talk to this trait, so everything above
/// the socket can be driven against an in-memory link.
pub trait DatagramLink: Send + Sync {
    /// Hand one datagram to the link without waiting.
    /// # Returns
    /// The number of bytes accepted. A link that cannot take the datagram right now
    /// reports `io::ErrorKind::WouldBlock`; the datagram is not kept.
    fn send_datagram(&self, datagram: &[u8], destination: SocketAddr) -> io::Result<usize>;
}
