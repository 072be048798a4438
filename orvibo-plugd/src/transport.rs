//! Outbound packet transmission.
//!
//! The engine never blocks on the network: sends go through the socket's
//! non-blocking path, and a failed send is logged and left for the next
//! reconciliation sweep to re-derive and re-send.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

pub trait Transport {
    /// Send one packet to a specific plug.
    fn send(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Broadcast one packet to every plug on the subnet.
    fn broadcast(&self, payload: &[u8]) -> io::Result<usize>;
}

/// Transport over the daemon's single broadcast-enabled UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, broadcast_addr: SocketAddr) -> Self {
        Self {
            socket,
            broadcast_addr,
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.try_send_to(payload, dest)
    }

    fn broadcast(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.try_send_to(payload, self.broadcast_addr)
    }
}
