//! Plugin chain composition.
//!
//! Every query runs through an ordered stack of plugins:
//! 1. Plugins registered first are outermost and see the message first
//! 2. Each plugin decides whether to call the rest of the chain
//! 3. A terminal handler finalizes whatever reaches the end
//!
//! Transports handle the I/O, the chain handles decisions.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use rustc_hash::FxHashSet;
use tracing::info;

use crate::dns;
use crate::error::Result;
use crate::transport::PacketConn;

/// A query travelling through the chain.
pub struct Request {
    /// Shared socket the query arrived on.
    pub conn: Arc<dyn PacketConn>,
    /// Where the message came from.
    pub peer: SocketAddr,
    pub message: Message,
}

impl Request {
    pub fn new(conn: Arc<dyn PacketConn>, peer: SocketAddr, message: Message) -> Self {
        Self {
            conn,
            peer,
            message,
        }
    }
}

/// One stage of the chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &mut Request) -> Result<()>;
}

pub type BoxedHandler = Arc<dyn Handler>;

/// A named middleware that wraps the rest of the chain.
pub trait Plugin: Send + Sync {
    /// Name used for registration logs and the disabled-plugin list.
    fn name(&self) -> &str;

    /// Return a handler that runs this plugin around `next`.
    fn wrap(self: Arc<Self>, next: BoxedHandler) -> BoxedHandler;
}

/// Marks the message answered so every query gets a finalized reply even if
/// no plugin supplied one.
struct Terminal;

#[async_trait]
impl Handler for Terminal {
    async fn handle(&self, req: &mut Request) -> Result<()> {
        dns::mark_answered(&mut req.message);
        Ok(())
    }
}

/// Collects plugins in execution order before the chain is built.
#[derive(Default)]
pub struct ChainBuilder {
    plugins: Vec<Arc<dyn Plugin>>,
    disabled: FxHashSet<String>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of plugins to leave out of the built chain.
    pub fn with_disabled<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled.extend(names.into_iter().map(Into::into));
        self
    }

    /// Append a plugin; it runs after everything registered so far.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        info!(plugin = plugin.name(), "Registered plugin");
        self.plugins.push(plugin);
        self
    }

    /// Prepend a plugin; it runs before everything registered so far.
    pub fn register_before(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        info!(plugin = plugin.name(), "Registered plugin");
        self.plugins.insert(0, plugin);
        self
    }

    /// Registered plugin names, front to back.
    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Fold the registered plugins into a single handler.
    pub fn build(self) -> Chain {
        let mut head: BoxedHandler = Arc::new(Terminal);
        let mut active = Vec::with_capacity(self.plugins.len());

        for plugin in self.plugins.into_iter().rev() {
            if self.disabled.contains(plugin.name()) {
                continue;
            }
            active.push(plugin.name().to_string());
            head = plugin.wrap(head);
        }
        active.reverse();

        Chain { head, active }
    }
}

/// The built, immutable plugin chain.
pub struct Chain {
    head: BoxedHandler,
    active: Vec<String>,
}

impl Chain {
    /// Run a request through every active plugin.
    pub async fn dispatch(&self, req: &mut Request) -> Result<()> {
        self.head.handle(req).await
    }

    /// Active plugin names in execution order.
    pub fn plugin_names(&self) -> &[String] {
        &self.active
    }
}
