//! Sluice - a forwarding DNS resolver with pluggable middleware.
//!
//! Every query runs through a chain of plugins: an answer cache, an ad
//! blocker, and DoH and plain UDP forwarders.

pub mod chain;
pub mod config;
pub mod dns;
pub mod error;
pub mod lookup;
pub mod metrics;
pub mod plugins;
pub mod proxy;
pub mod transport;

pub use error::{Error, Result};
