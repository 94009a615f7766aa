//! Host lookups for the resolver's own HTTP clients.
//!
//! With `--use-internal-resolver` the ad-block list downloads and DoH
//! requests resolve their host names through the first UDP forwarder instead
//! of the system resolver.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use reqwest::dns::{Addrs, Resolve, Resolving};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::dns;
use crate::error::Result;
use crate::transport::MAX_DNS_PACKET_SIZE;

/// Upper bound on one lookup, both record types included.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves host names with plain A/AAAA queries to a single forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderLookup {
    upstream: SocketAddr,
}

impl ForwarderLookup {
    pub fn new(upstream: SocketAddr) -> Self {
        Self { upstream }
    }

    /// IPv4 addresses first, then IPv6.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let name = Name::from_str(host)?;
        let mut ips = self.query(&name, RecordType::A).await?;
        ips.extend(self.query(&name, RecordType::AAAA).await?);
        debug!(host, upstream = %self.upstream, found = ips.len(), "Resolved host");
        Ok(ips)
    }

    async fn query(&self, name: &Name, record_type: RecordType) -> Result<Vec<IpAddr>> {
        let unspecified = if self.upstream.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
        socket.connect(self.upstream).await?;

        let mut message = Message::new();
        message.set_id(rand::random());
        message.set_recursion_desired(true);
        message.add_query(Query::query(name.clone(), record_type));
        socket.send(&dns::encode(&message)?).await?;

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        loop {
            let len = socket.recv(&mut buf).await?;
            let Ok(reply) = dns::decode(&buf[..len]) else {
                continue;
            };
            if reply.id() != message.id() || !dns::is_response(&reply) {
                continue;
            }
            return Ok(reply
                .answers()
                .iter()
                .filter_map(|record| match record.data() {
                    RData::A(a) => Some(IpAddr::V4(a.0)),
                    RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
                    _ => None,
                })
                .collect());
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl Resolve for ForwarderLookup {
    fn resolve(&self, name: reqwest::dns::Name) -> Resolving {
        Box::pin(resolve_addrs(self.clone(), name))
    }
}

async fn resolve_addrs(
    lookup: ForwarderLookup,
    name: reqwest::dns::Name,
) -> std::result::Result<Addrs, BoxError> {
    let host = name.as_str();
    let ips = tokio::time::timeout(LOOKUP_TIMEOUT, lookup.lookup(host))
        .await
        .map_err(|_| format!("lookup of {host} timed out"))??;
    if ips.is_empty() {
        return Err(format!("no addresses for {host}").into());
    }
    // reqwest fills in the port from the URL.
    Ok(Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0))))
}
