//! Command line and environment configuration.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::lookup::ForwarderLookup;
use crate::plugins::adblock::ListSources;

/// Port used for forwarders given without one.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// How often [`Readiness::wait`] re-checks the flag.
const READINESS_POLL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug, Clone)]
#[command(name = "sluice")]
#[command(about = "Forwarding DNS resolver with pluggable middleware", long_about = None)]
pub struct Config {
    /// Addresses to listen on
    #[arg(
        short,
        long,
        env = "SLUICE_BIND",
        value_delimiter = ',',
        default_value = "127.0.0.1"
    )]
    pub bind: Vec<IpAddr>,

    /// Port to listen on
    #[arg(short, long, env = "SLUICE_PORT", default_value_t = DEFAULT_DNS_PORT)]
    pub port: u16,

    /// UDP forwarders, `ip` or `ip:port`, tried in order
    #[arg(
        long,
        env = "SLUICE_FORWARDERS",
        value_delimiter = ',',
        default_value = "1.1.1.1,1.0.0.1"
    )]
    pub forwarders: Vec<String>,

    /// DoH forwarder hosts, tried in order
    #[arg(long, env = "SLUICE_DOH_FORWARDERS", value_delimiter = ',')]
    pub doh_forwarders: Vec<String>,

    /// Hosts to block
    #[arg(long, env = "SLUICE_BLACKLIST", value_delimiter = ',')]
    pub blacklist: Vec<String>,

    /// Hosts never to block
    #[arg(long, env = "SLUICE_WHITELIST", value_delimiter = ',')]
    pub whitelist: Vec<String>,

    /// URLs of remote block lists
    #[arg(long, env = "SLUICE_BLOCKLISTS", value_delimiter = ',')]
    pub blocklists: Vec<String>,

    /// URLs of remote allow lists
    #[arg(long, env = "SLUICE_WHITELISTS", value_delimiter = ',')]
    pub whitelists: Vec<String>,

    /// Plugins to leave out of the chain
    #[arg(long, env = "SLUICE_DISABLED_PLUGINS", value_delimiter = ',')]
    pub disabled_plugins: Vec<String>,

    /// Resolve list and DoH host names through the first forwarder
    #[arg(long, env = "SLUICE_USE_INTERNAL_RESOLVER")]
    pub use_internal_resolver: bool,

    /// Log filter directive; `verbose` and `vverbose` are accepted too
    #[arg(long, env = "SLUICE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// One listener address per bind address.
    pub fn bind_addrs(&self) -> Vec<SocketAddr> {
        self.bind
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }

    /// Forwarder addresses in configured order.
    pub fn upstream_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.forwarders
            .iter()
            .map(String::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_upstream)
            .collect()
    }

    /// DoH hosts with blank entries dropped.
    pub fn doh_hosts(&self) -> Vec<String> {
        non_empty(&self.doh_forwarders)
    }

    pub fn list_sources(&self) -> ListSources {
        ListSources {
            blacklist: non_empty(&self.blacklist),
            whitelist: non_empty(&self.whitelist),
            blocklists: non_empty(&self.blocklists),
            whitelists: non_empty(&self.whitelists),
        }
    }

    /// Lookup through the first forwarder, when enabled and one is configured.
    pub fn internal_lookup(&self) -> Result<Option<ForwarderLookup>> {
        if !self.use_internal_resolver {
            return Ok(None);
        }
        Ok(self.upstream_addrs()?.first().copied().map(ForwarderLookup::new))
    }

    /// `EnvFilter` directive for the configured log level.
    pub fn log_directive(&self) -> &str {
        match self.log_level.as_str() {
            "verbose" => "debug",
            "vverbose" => "trace",
            other => other,
        }
    }
}

/// Parse `ip` (port 53) or `ip:port`.
pub fn parse_upstream(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
        .map_err(|_| Error::InvalidUpstream(s.to_string()))
}

fn non_empty(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Raised once every listener is bound.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Resolve once the flag is raised.
    pub async fn wait(&self) {
        while !self.is_ready() {
            tokio::time::sleep(READINESS_POLL).await;
        }
    }
}
