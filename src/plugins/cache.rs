//! Answer cache with TTL-based expiration.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::Record;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::chain::{BoxedHandler, Handler, Plugin, Request};
use crate::dns;
use crate::error::Result;
use crate::metrics::{Metrics, outcome};

pub const NAME: &str = "cache_resolver";

/// How often expired entries are swept out.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct CacheEntry {
    created_at: Instant,
    expires_at: Instant,
    answers: Vec<Record>,
}

/// TTL-based answer cache keyed by the question set.
///
/// Entries live for the TTL of their first answer record. Expired entries are
/// dropped on the next lookup or by the periodic sweep.
pub struct CachePlugin {
    entries: RwLock<FxHashMap<String, CacheEntry>>,
    metrics: Arc<Metrics>,
}

impl CachePlugin {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            metrics,
        }
    }

    /// Look up fresh answers for `key`.
    ///
    /// Returned records are copies with their TTL set to the whole seconds
    /// left, rounded up. An expired entry is removed and reported as a miss.
    pub fn get(&self, key: &str, now: Instant) -> Option<Vec<Record>> {
        {
            let Ok(entries) = self.entries.read() else {
                return None;
            };
            let entry = entries.get(key)?;
            if now < entry.expires_at {
                let ttl = remaining_ttl(entry.expires_at, now);
                trace!(
                    key,
                    age_secs = now.saturating_duration_since(entry.created_at).as_secs(),
                    ttl,
                    "Cache entry fresh"
                );
                return Some(
                    entry
                        .answers
                        .iter()
                        .map(|record| {
                            let mut record = record.clone();
                            record.set_ttl(ttl);
                            record
                        })
                        .collect(),
                );
            }
        }

        // Not atomic with the read above; removing twice is harmless.
        if let Ok(mut entries) = self.entries.write() {
            if entries.get(key).is_some_and(|e| now >= e.expires_at) {
                entries.remove(key);
            }
        }
        None
    }

    /// Store a snapshot of `answers`, replacing any entry for `key`.
    pub fn put(&self, key: String, answers: &[Record], now: Instant) {
        let Some(first) = answers.first() else {
            return;
        };
        let expires_at = now + Duration::from_secs(u64::from(first.ttl()));

        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        entries.insert(
            key,
            CacheEntry {
                created_at: now,
                expires_at,
                answers: answers.to_vec(),
            },
        );
    }

    /// Remove every entry expired at `now`; returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        self.metrics.set_cache_records(entries.len());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweep.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.sweep(Instant::now());
                debug!(removed, remaining = cache.len(), "Cache sweep completed");
            }
        })
    }
}

/// Whole seconds until `expires_at`, rounded up.
fn remaining_ttl(expires_at: Instant, now: Instant) -> u32 {
    let left = expires_at.saturating_duration_since(now);
    let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

impl Plugin for CachePlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn wrap(self: Arc<Self>, next: BoxedHandler) -> BoxedHandler {
        Arc::new(CacheHandler { cache: self, next })
    }
}

struct CacheHandler {
    cache: Arc<CachePlugin>,
    next: BoxedHandler,
}

#[async_trait]
impl Handler for CacheHandler {
    async fn handle(&self, req: &mut Request) -> Result<()> {
        let key = dns::cache_key(&req.message);

        if !dns::is_response(&req.message) {
            if let Some(answers) = self.cache.get(&key, Instant::now()) {
                self.cache.metrics.inc_request(outcome::CACHED);
                dns::mark_answered(&mut req.message);
                req.message.add_answers(answers);
                return Ok(());
            }
        }

        let result = self.next.handle(req).await;

        if dns::is_response(&req.message) && !req.message.answers().is_empty() {
            self.cache.put(key, req.message.answers(), Instant::now());
        }

        result
    }
}
