//! DNS-over-HTTPS forwarding (RFC 8484).
//!
//! Queries are POSTed in wire format to `https://<host>/dns-query`, one host
//! at a time. A host that does not answer within a second is skipped, but a
//! host that answers badly ends the resolution with an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::Record;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::time::Instant;
use tracing::debug;

use crate::chain::{BoxedHandler, Handler, Plugin, Request};
use crate::dns::{self, DNS_MESSAGE_CONTENT_TYPE};
use crate::error::{Error, Result};
use crate::lookup::ForwarderLookup;
use crate::metrics::Metrics;

pub const NAME: &str = "doh_forward_resolver";

/// How long a single host gets to answer.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

fn client(lookup: Option<Arc<ForwarderLookup>>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(Duration::from_secs(5 * 60));
    if let Some(lookup) = lookup {
        builder = builder.dns_resolver(lookup);
    }
    Ok(builder.build()?)
}

pub struct DohPlugin {
    hosts: Vec<String>,
    client: reqwest::Client,
    scheme: &'static str,
    metrics: Arc<Metrics>,
}

impl DohPlugin {
    pub fn new(hosts: Vec<String>, metrics: Arc<Metrics>) -> Result<Self> {
        Ok(Self {
            hosts,
            client: client(None)?,
            scheme: "https",
            metrics,
        })
    }

    /// Resolve the DoH host names through `lookup` instead of the system.
    pub fn with_lookup(mut self, lookup: Arc<ForwarderLookup>) -> Result<Self> {
        self.client = client(Some(lookup))?;
        Ok(self)
    }

    /// Talk to the hosts with another URL scheme, such as plain `http` for a
    /// local test server.
    pub fn with_scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = scheme;
        self
    }

    /// Ask each host in turn; an empty vec means none answered in time.
    async fn resolve(&self, message: &Message) -> Result<Vec<Record>> {
        let packet = dns::encode(message)?;

        for host in &self.hosts {
            match tokio::time::timeout(ATTEMPT_TIMEOUT, self.exchange(host, &packet)).await {
                Ok(Ok(Some(answers))) => return Ok(answers),
                Ok(Ok(None)) => debug!(host = %host, "DoH server returned no answers"),
                Ok(Err(e)) => return Err(e),
                Err(_) => debug!(host = %host, "DoH server timed out"),
            }
        }

        Ok(Vec::new())
    }

    /// One POST round trip. `None` when the reply is valid but carries no
    /// answers.
    async fn exchange(&self, host: &str, packet: &[u8]) -> Result<Option<Vec<Record>>> {
        let url = format!("{}://{}/dns-query", self.scheme, host);
        debug!(url = %url, len = packet.len(), "Sending DoH query");

        let response = self
            .client
            .post(&url)
            .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .header(CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .body(packet.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::DohStatus {
                host: host.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_dns_message(&content_type) {
            return Err(Error::DohContentType {
                host: host.to_string(),
                content_type,
            });
        }

        let body = response.bytes().await?;
        let reply = dns::decode(&body)?;
        if !dns::is_response(&reply) {
            return Err(Error::DohNotResponse(host.to_string()));
        }

        if reply.answers().is_empty() {
            return Ok(None);
        }
        Ok(Some(reply.answers().to_vec()))
    }
}

/// Media type check that ignores parameters such as `charset`.
fn is_dns_message(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(DNS_MESSAGE_CONTENT_TYPE))
}

impl Plugin for DohPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn wrap(self: Arc<Self>, next: BoxedHandler) -> BoxedHandler {
        Arc::new(DohHandler { doh: self, next })
    }
}

struct DohHandler {
    doh: Arc<DohPlugin>,
    next: BoxedHandler,
}

#[async_trait]
impl Handler for DohHandler {
    async fn handle(&self, req: &mut Request) -> Result<()> {
        if !dns::is_response(&req.message) {
            let start = Instant::now();
            let answers = self.doh.resolve(&req.message).await?;
            self.doh
                .metrics
                .observe_doh_forwarder_ms(start.elapsed().as_millis() as f64);

            dns::mark_answered(&mut req.message);
            req.message.add_answers(answers);
        }

        self.next.handle(req).await
    }
}
