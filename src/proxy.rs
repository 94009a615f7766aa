//! Resolver orchestration.
//!
//! Builds the plugin chain from configuration, binds every listener and runs
//! the background jobs:
//! 1. Cache sweeper, every minute
//! 2. Ad-block list refresh, once ready and then hourly
//! 3. Stats log line, every minute

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::chain::{Chain, ChainBuilder};
use crate::config::{Config, Readiness};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::plugins::adblock::{self, AdBlockPlugin};
use crate::plugins::cache::{self, CachePlugin};
use crate::plugins::doh::DohPlugin;
use crate::plugins::forward::ForwardPlugin;
use crate::transport::udp::UdpTransport;

/// How often the stats line is logged.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// A running resolver.
pub struct Proxy {
    local_addrs: Vec<SocketAddr>,
    chain: Arc<Chain>,
    metrics: Arc<Metrics>,
    tasks: Vec<JoinHandle<()>>,
}

impl Proxy {
    /// Build the chain, bind the listeners and start every background job.
    pub async fn start(config: &Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let readiness = Readiness::new();

        let mut builder =
            ChainBuilder::new().with_disabled(config.disabled_plugins.iter().cloned());

        let lookup = config.internal_lookup()?.map(Arc::new);
        if let Some(lookup) = &lookup {
            info!(upstream = ?lookup, "Resolving own host names through forwarder");
        }

        let mut blocker = AdBlockPlugin::new(config.list_sources(), metrics.clone())?;
        if let Some(lookup) = &lookup {
            blocker = blocker.with_lookup(lookup.clone())?;
        }
        let blocker = Arc::new(blocker);
        builder.register(blocker.clone());

        let doh_hosts = config.doh_hosts();
        if !doh_hosts.is_empty() {
            let mut doh = DohPlugin::new(doh_hosts, metrics.clone())?;
            if let Some(lookup) = &lookup {
                doh = doh.with_lookup(lookup.clone())?;
            }
            builder.register(Arc::new(doh));
        }

        let upstreams = config.upstream_addrs()?;
        if !upstreams.is_empty() {
            builder.register(Arc::new(ForwardPlugin::new(upstreams, metrics.clone())));
        }

        // Cache runs first so hits skip blocking and forwarding.
        let cache = Arc::new(CachePlugin::new(metrics.clone()));
        builder.register_before(cache.clone());

        let chain = Arc::new(builder.build());
        info!(plugins = ?chain.plugin_names(), "Plugin chain built");

        let mut tasks = Vec::new();
        let mut local_addrs = Vec::new();
        for addr in config.bind_addrs() {
            let transport = UdpTransport::bind(addr).await?;
            let local = transport.local_addr()?;
            info!(addr = %local, "Listening for DNS requests");
            local_addrs.push(local);
            tasks.push(transport.start(chain.clone(), metrics.clone()));
        }

        let active = |name: &str| chain.plugin_names().iter().any(|p| p == name);
        if active(cache::NAME) {
            tasks.push(cache.start_sweeper());
        }
        if active(adblock::NAME) {
            tasks.push(blocker.start(readiness.clone()));
        }
        tasks.push(spawn_stats(metrics.clone()));

        readiness.mark_ready();

        Ok(Self {
            local_addrs,
            chain,
            metrics,
            tasks,
        })
    }

    /// Bound listener addresses, in configured order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stop the listeners and background jobs.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

fn spawn_stats(metrics: Arc<Metrics>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = metrics.snapshot();
            info!(
                requests = stats.requests,
                handled = stats.handled,
                rejected = stats.rejected,
                failed = stats.failed,
                cached = stats.cached,
                blocked = stats.blocked,
                cache = stats.cache_records,
                blacklist = stats.blacklist,
                whitelist = stats.whitelist,
                "Stats"
            );
        }
    })
}

/// Run the resolver until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let proxy = Proxy::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    proxy.shutdown();

    Ok(())
}
