//! Transport layer for the resolver.
//!
//! The UDP transport receives client queries and upstream replies on the same
//! socket and hands each datagram to the plugin chain.

pub mod udp;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Send side of a shared packet socket.
///
/// Plugins that talk to upstream servers write through this so their replies
/// arrive back on the listener that owns the socket.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }
}
