use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::protocol::{decode, Frame};
use crate::util::traits::DatagramLink;

/// Keeps every datagram it is asked to send.
#[derive(Default)]
pub(crate) struct RecordingLink {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl RecordingLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingLink::default())
    }

    pub(crate) fn datagrams(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn frames(&self) -> Vec<(Frame, SocketAddr)> {
        self.datagrams()
            .into_iter()
            .map(|(datagram, destination)| (decode(&datagram).unwrap(), destination))
            .collect()
    }

    pub(crate) fn last_frame(&self) -> Frame {
        self.frames().pop().unwrap().0
    }

    pub(crate) fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl DatagramLink for RecordingLink {
    fn send_datagram(&self, datagram: &[u8], destination: SocketAddr) -> io::Result<usize> {
        self.sent
            .lock()
            .unwrap()
            .push((datagram.to_vec(), destination));
        Ok(datagram.len())
    }
}
