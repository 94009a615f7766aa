//! Metrics for the resolver pipeline.
//!
//! Plugins only write to these; exposing them is left to whoever owns the
//! registry (see [`Metrics::render`]).

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder, linear_buckets,
};

use crate::error::Result;

/// Request outcome labels for `sluice_request_totals`.
pub mod outcome {
    pub const REQUEST: &str = "request";
    pub const HANDLED: &str = "handled";
    pub const REJECTED: &str = "rejected";
    pub const FAILED: &str = "failed";
    pub const CACHED: &str = "cached";
    pub const BLOCKED: &str = "blocked";
}

/// Prometheus metrics shared by the dispatcher and every plugin.
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    cache_records: IntGauge,
    adblock_blacklist: IntGauge,
    adblock_whitelist: IntGauge,
    adblock_updates: IntCounter,
    forwarder_latency: Histogram,
    doh_forwarder_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("sluice_request_totals", "Total number of requests processed"),
            &["type"],
        )?;
        let cache_records = IntGauge::new("sluice_cache_count", "Number of records in cache")?;
        let adblock_blacklist = IntGauge::new(
            "sluice_adblock_blacklist",
            "Number of records in the blacklist",
        )?;
        let adblock_whitelist = IntGauge::new(
            "sluice_adblock_whitelist",
            "Number of records in the whitelist",
        )?;
        let adblock_updates = IntCounter::new(
            "sluice_adblock_update_count",
            "Number of times the ad blocker has refreshed its lists",
        )?;
        let forwarder_latency = Histogram::with_opts(
            HistogramOpts::new(
                "sluice_forwarder_query",
                "Milliseconds taken to get a response from UDP forwarders",
            )
            .buckets(linear_buckets(1.0, 2.0, 15)?),
        )?;
        let doh_forwarder_latency = Histogram::with_opts(
            HistogramOpts::new(
                "sluice_doh_forwarder_query",
                "Milliseconds taken to get a response from DoH forwarders",
            )
            .buckets(linear_buckets(1.0, 2.0, 15)?),
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(cache_records.clone()))?;
        registry.register(Box::new(adblock_blacklist.clone()))?;
        registry.register(Box::new(adblock_whitelist.clone()))?;
        registry.register(Box::new(adblock_updates.clone()))?;
        registry.register(Box::new(forwarder_latency.clone()))?;
        registry.register(Box::new(doh_forwarder_latency.clone()))?;

        Ok(Self {
            registry,
            requests,
            cache_records,
            adblock_blacklist,
            adblock_whitelist,
            adblock_updates,
            forwarder_latency,
            doh_forwarder_latency,
        })
    }

    pub fn inc_request(&self, label: &str) {
        self.requests.with_label_values(&[label]).inc();
    }

    pub fn set_cache_records(&self, count: usize) {
        self.cache_records.set(count as i64);
    }

    pub fn record_adblock_update(&self, blocked: usize, allowed: usize) {
        self.adblock_updates.inc();
        self.adblock_blacklist.set(blocked as i64);
        self.adblock_whitelist.set(allowed as i64);
    }

    pub fn observe_forwarder_ms(&self, ms: f64) {
        self.forwarder_latency.observe(ms);
    }

    pub fn observe_doh_forwarder_ms(&self, ms: f64) {
        self.doh_forwarder_latency.observe(ms);
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Current counter and gauge values for the periodic stats log line.
    pub fn snapshot(&self) -> StatsSnapshot {
        let count = |label: &str| self.requests.with_label_values(&[label]).get();
        StatsSnapshot {
            requests: count(outcome::REQUEST),
            handled: count(outcome::HANDLED),
            rejected: count(outcome::REJECTED),
            failed: count(outcome::FAILED),
            cached: count(outcome::CACHED),
            blocked: count(outcome::BLOCKED),
            cache_records: self.cache_records.get(),
            blacklist: self.adblock_blacklist.get(),
            whitelist: self.adblock_whitelist.get(),
            adblock_updates: self.adblock_updates.get(),
            forwarded: self.forwarder_latency.get_sample_count()
                + self.doh_forwarder_latency.get_sample_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub handled: u64,
    pub rejected: u64,
    pub failed: u64,
    pub cached: u64,
    pub blocked: u64,
    pub cache_records: i64,
    pub blacklist: i64,
    pub whitelist: i64,
    pub adblock_updates: u64,
    pub forwarded: u64,
}
