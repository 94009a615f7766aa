//! UDP transport for DNS queries.
//!
//! One socket carries both client queries and the replies of upstream
//! servers the forwarder sent to, so every decoded datagram goes through the
//! plugin chain. Only client queries are answered; upstream replies are
//! consumed by the chain.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::chain::{Chain, Request};
use crate::dns;
use crate::metrics::{Metrics, outcome};

use super::{MAX_DNS_PACKET_SIZE, PacketConn};

/// UDP listener feeding the plugin chain.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the receive loop.
    pub fn start(self, chain: Arc<Chain>, metrics: Arc<Metrics>) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, chain, metrics))
    }
}

/// Receive loop: decode each datagram and hand it to its own task.
async fn run(socket: Arc<UdpSocket>, chain: Arc<Chain>, metrics: Arc<Metrics>) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP recv error");
                continue;
            }
        };

        let message = match dns::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %peer, len, error = %e, "Failed to parse DNS request");
                continue;
            }
        };

        tokio::spawn(handle_datagram(
            socket.clone(),
            chain.clone(),
            metrics.clone(),
            peer,
            message,
        ));
    }
}

async fn handle_datagram(
    socket: Arc<UdpSocket>,
    chain: Arc<Chain>,
    metrics: Arc<Metrics>,
    peer: SocketAddr,
    message: Message,
) {
    let upstream_reply = dns::is_response(&message);
    if !upstream_reply {
        metrics.inc_request(outcome::REQUEST);
        debug!(peer = %peer, id = message.id(), questions = %dns::describe_questions(&message), "Query");
    }

    let conn: Arc<dyn PacketConn> = socket.clone();
    let mut req = Request::new(conn, peer, message);
    if let Err(e) = chain.dispatch(&mut req).await {
        metrics.inc_request(outcome::FAILED);
        warn!(peer = %peer, error = %e, "Failed to handle DNS request");
    }

    if upstream_reply {
        return;
    }

    if !dns::is_response(&req.message) || req.message.answers().is_empty() {
        metrics.inc_request(outcome::REJECTED);
    } else {
        metrics.inc_request(outcome::HANDLED);
    }

    dns::mark_answered(&mut req.message);
    trace!(peer = %peer, response = ?req.message, "Response");

    match dns::encode(&req.message) {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                warn!(peer = %peer, error = %e, "UDP response error");
            }
        }
        Err(e) => warn!(peer = %peer, error = %e, "Failed to encode DNS response"),
    }
}
