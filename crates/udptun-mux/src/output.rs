use std::{
    io::{self, Write},
    net::SocketAddr,
    rc::Rc,
};

use tokio::net::UdpSocket;

use crate::metrics::Metrics;

/// Engine output that hands every datagram straight to the shared UDP socket.
///
/// Sends are attempted once, synchronously. A full socket buffer or any other send error drops
/// the datagram; the engine's retransmission timer recovers it.
pub(crate) struct DatagramOutput {
    socket: Rc<UdpSocket>,
    /// `None` for a connected socket.
    peer: Option<SocketAddr>,
    metrics: Metrics,
}

impl DatagramOutput {
    pub(crate) fn connected(socket: Rc<UdpSocket>, metrics: Metrics) -> Self {
        Self {
            socket,
            peer: None,
            metrics,
        }
    }

    pub(crate) fn to_peer(socket: Rc<UdpSocket>, peer: SocketAddr, metrics: Metrics) -> Self {
        Self {
            socket,
            peer: Some(peer),
            metrics,
        }
    }
}

impl Write for DatagramOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = match self.peer {
            Some(peer) => self.socket.try_send_to(buf, peer),
            None => self.socket.try_send(buf),
        };
        match res {
            Ok(_) => self.metrics.datagram_tx(buf.len()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!(len = buf.len(), "udp send would block; dropping datagram");
                self.metrics.send_failed();
            }
            Err(err) => {
                tracing::debug!(peer = ?self.peer, "udp send failed: {err}");
                self.metrics.send_failed();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
