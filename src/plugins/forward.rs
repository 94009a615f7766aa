//! Plain UDP forwarding.
//!
//! Upstream replies come back on the listener socket, so they re-enter the
//! chain like any client query. The forwarder correlates them itself:
//! 1. Before each attempt a waiter is registered under the query id
//! 2. The query is sent to one upstream through the shared socket
//! 3. Replies arriving on the socket are fanned out to every waiter
//! 4. A waiter accepts the first reply whose questions equal its own
//!
//! Upstreams are tried in order, each for at most one second.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::Record;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::chain::{BoxedHandler, Handler, Plugin, Request};
use crate::dns;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::transport::PacketConn;

pub const NAME: &str = "forward_resolver";

/// How long a single upstream gets to answer.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Hard lifetime of a waiter, answered or not.
pub const WAITER_DEADLINE: Duration = Duration::from_secs(5);

/// Replies buffered per waiter before fanout starts dropping them.
const WAITER_BUFFER: usize = 8;

struct Waiter {
    token: u64,
    tx: mpsc::Sender<Arc<Message>>,
}

/// In-flight waiters keyed by query id.
#[derive(Default)]
pub struct WaiterRegistry {
    waiters: RwLock<FxHashMap<u16, Waiter>>,
    next_token: AtomicU64,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id` and spawn the task that matches replies
    /// against `questions`.
    ///
    /// The returned receiver yields the matching reply's answers. It is closed
    /// without a value if the deadline passes or the waiter is replaced by a
    /// later registration of the same id.
    pub fn spawn_waiter(
        self: &Arc<Self>,
        id: u16,
        questions: Vec<Query>,
    ) -> oneshot::Receiver<Vec<Record>> {
        let (done_tx, done_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::channel(WAITER_BUFFER);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut waiters) = self.waiters.write() {
            waiters.insert(id, Waiter { token, tx });
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let deadline = Instant::now() + WAITER_DEADLINE;
            while let Ok(Some(reply)) = tokio::time::timeout_at(deadline, rx.recv()).await {
                if !dns::is_response(&reply) {
                    continue;
                }
                if reply.queries() == questions.as_slice() {
                    // The attempt may have given up already; nobody to tell then.
                    let _ = done_tx.send(reply.answers().to_vec());
                    break;
                }
                trace!(id, "Ignoring reply for other questions");
            }
            registry.deregister(id, token);
        });

        done_rx
    }

    /// Remove the waiter for `id` if it is still the one holding `token`.
    fn deregister(&self, id: u16, token: u64) {
        let Ok(mut waiters) = self.waiters.write() else {
            return;
        };
        if waiters.get(&id).is_some_and(|w| w.token == token) {
            waiters.remove(&id);
        }
    }

    /// Offer a reply to every waiter without blocking; returns how many
    /// accepted it.
    pub fn fanout(&self, reply: Arc<Message>) -> usize {
        let Ok(waiters) = self.waiters.read() else {
            return 0;
        };
        waiters
            .values()
            .filter(|w| w.tx.try_send(Arc::clone(&reply)).is_ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.waiters.read().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forwards queries to UDP upstreams in order until one answers.
pub struct ForwardPlugin {
    upstreams: Vec<SocketAddr>,
    waiters: Arc<WaiterRegistry>,
    metrics: Arc<Metrics>,
}

impl ForwardPlugin {
    pub fn new(upstreams: Vec<SocketAddr>, metrics: Arc<Metrics>) -> Self {
        Self {
            upstreams,
            waiters: Arc::new(WaiterRegistry::new()),
            metrics,
        }
    }

    /// Try every upstream in turn; an empty vec means none answered.
    async fn resolve(&self, conn: &dyn PacketConn, message: &Message) -> Vec<Record> {
        let packet = match dns::encode(message) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Failed to encode query for forwarding");
                return Vec::new();
            }
        };

        for &upstream in &self.upstreams {
            if let Some(answers) = self.attempt(conn, upstream, &packet, message).await {
                return answers;
            }
        }

        debug!(
            questions = %dns::describe_questions(message),
            "No upstream answered"
        );
        Vec::new()
    }

    async fn attempt(
        &self,
        conn: &dyn PacketConn,
        upstream: SocketAddr,
        packet: &[u8],
        message: &Message,
    ) -> Option<Vec<Record>> {
        let done = self
            .waiters
            .spawn_waiter(message.id(), message.queries().to_vec());

        if let Err(e) = conn.send_to(packet, upstream).await {
            warn!(upstream = %upstream, error = %e, "Failed to forward request");
            return None;
        }

        let deadline = Instant::now() + ATTEMPT_TIMEOUT;
        match tokio::time::timeout_at(deadline, done).await {
            Ok(Ok(answers)) => return Some(answers),
            // Replaced by a later waiter for the same id; the attempt still
            // only ends at its timeout.
            Ok(Err(_)) => tokio::time::sleep_until(deadline).await,
            Err(_) => {}
        }
        debug!(upstream = %upstream, "Upstream timed out");
        None
    }
}

impl Plugin for ForwardPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn wrap(self: Arc<Self>, next: BoxedHandler) -> BoxedHandler {
        Arc::new(ForwardHandler {
            forwarder: self,
            next,
        })
    }
}

struct ForwardHandler {
    forwarder: Arc<ForwardPlugin>,
    next: BoxedHandler,
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle(&self, req: &mut Request) -> Result<()> {
        if dns::is_response(&req.message) {
            let delivered = self
                .forwarder
                .waiters
                .fanout(Arc::new(req.message.clone()));
            trace!(id = req.message.id(), delivered, "Upstream reply fanned out");
        } else {
            let start = Instant::now();
            let answers = self.forwarder.resolve(req.conn.as_ref(), &req.message).await;
            self.forwarder
                .metrics
                .observe_forwarder_ms(start.elapsed().as_millis() as f64);

            dns::mark_answered(&mut req.message);
            req.message.add_answers(answers);
        }

        self.next.handle(req).await
    }
}
