//! Ad blocking.
//!
//! Answers queries for blocked hosts with an empty response instead of
//! forwarding them. The block and allow lists are merged from configuration
//! and remote list URLs once at startup and then every hour.

mod lists;

pub use lists::{HostSet, parse_lines};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::{BoxedHandler, Handler, Plugin, Request};
use crate::config::Readiness;
use crate::dns;
use crate::error::{Error, Result};
use crate::lookup::ForwarderLookup;
use crate::metrics::{Metrics, outcome};

pub const NAME: &str = "ad_blocker";

/// Time between list refreshes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Upper bound on a single list download.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the block and allow lists come from.
#[derive(Debug, Clone, Default)]
pub struct ListSources {
    /// Hosts blocked straight from configuration.
    pub blacklist: Vec<String>,
    /// Hosts allowed straight from configuration.
    pub whitelist: Vec<String>,
    /// URLs of remote block lists.
    pub blocklists: Vec<String>,
    /// URLs of remote allow lists.
    pub whitelists: Vec<String>,
}

fn list_client(lookup: Option<Arc<ForwarderLookup>>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(10))
        .timeout(FETCH_TIMEOUT);
    if let Some(lookup) = lookup {
        builder = builder.dns_resolver(lookup);
    }
    Ok(builder.build()?)
}

pub struct AdBlockPlugin {
    blocked: HostSet,
    allowed: HostSet,
    sources: ListSources,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl AdBlockPlugin {
    pub fn new(sources: ListSources, metrics: Arc<Metrics>) -> Result<Self> {
        Ok(Self {
            blocked: HostSet::new(),
            allowed: HostSet::new(),
            sources,
            client: list_client(None)?,
            metrics,
        })
    }

    /// Resolve list hosts through `lookup` instead of the system.
    pub fn with_lookup(mut self, lookup: Arc<ForwarderLookup>) -> Result<Self> {
        self.client = list_client(Some(lookup))?;
        Ok(self)
    }

    /// Blocked and not explicitly allowed.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.blocked.contains(host) && !self.allowed.contains(host)
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn allowed_count(&self) -> usize {
        self.allowed.len()
    }

    /// Merge static entries and every remote list into the sets.
    ///
    /// Each download is independent; a failing one is logged and skipped.
    pub async fn refresh(&self) {
        self.allowed.extend(self.sources.whitelist.iter().cloned());
        if !self.allowed.is_empty() {
            info!(count = self.allowed.len(), "Whitelisted domains");
        }
        self.blocked.extend(self.sources.blacklist.iter().cloned());
        if !self.blocked.is_empty() {
            info!(count = self.blocked.len(), "Blacklisted domains");
        }

        info!(
            blocklists = self.sources.blocklists.len(),
            whitelists = self.sources.whitelists.len(),
            "Updating host lists"
        );

        let fetches = self
            .sources
            .blocklists
            .iter()
            .map(|url| (url, &self.blocked))
            .chain(self.sources.whitelists.iter().map(|url| (url, &self.allowed)))
            .map(|(url, set)| async move {
                match self.fetch_into(url, set).await {
                    Ok(accepted) => debug!(url = %url, accepted, "Host list merged"),
                    Err(e) => warn!(url = %url, error = %e, "Failed to update host list"),
                }
            });
        join_all(fetches).await;

        let blocked = self.blocked.len();
        let allowed = self.allowed.len();
        info!(blocked, allowed, "Updated host lists");
        self.metrics.record_adblock_update(blocked, allowed);
    }

    async fn fetch_into(&self, url: &str, set: &HostSet) -> Result<usize> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        let text = std::str::from_utf8(&body).map_err(|e| Error::ListParse {
            source_url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(set.merge_body(text))
    }

    /// Spawn the refresh loop: once `readiness` is raised, then every hour.
    pub fn start(self: &Arc<Self>, readiness: Readiness) -> JoinHandle<()> {
        let blocker = Arc::clone(self);
        tokio::spawn(async move {
            readiness.wait().await;
            info!(
                interval_secs = REFRESH_INTERVAL.as_secs(),
                "Starting host list refresh job"
            );

            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                interval.tick().await;
                blocker.refresh().await;
            }
        })
    }
}

impl Plugin for AdBlockPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn wrap(self: Arc<Self>, next: BoxedHandler) -> BoxedHandler {
        Arc::new(AdBlockHandler {
            blocker: self,
            next,
        })
    }
}

struct AdBlockHandler {
    blocker: Arc<AdBlockPlugin>,
    next: BoxedHandler,
}

#[async_trait]
impl Handler for AdBlockHandler {
    async fn handle(&self, req: &mut Request) -> Result<()> {
        if let Some(domain) = dns::first_domain(&req.message) {
            if self.blocker.is_blocked(&domain) {
                debug!(domain = %domain, "Blocked");
                self.blocker.metrics.inc_request(outcome::BLOCKED);
                // No answer records: the client sees an empty response.
                dns::mark_answered(&mut req.message);
                return Ok(());
            }
        }

        self.next.handle(req).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::chain::ChainBuilder;
    use crate::dns::fixtures::query;
    use crate::lookup::fixtures::hosts_upstream;
    use crate::plugins::cache::CachePlugin;
    use crate::transport::fixtures::NullConn;

    fn blocker(sources: ListSources) -> Arc<AdBlockPlugin> {
        Arc::new(AdBlockPlugin::new(sources, Arc::new(Metrics::new().unwrap())).unwrap())
    }

    /// Serves each request with the body registered for its path, or 404.
    async fn serve_lists(routes: Vec<(&'static str, &'static [u8])>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let head = String::from_utf8_lossy(&buf[..n]);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let response = match routes.iter().find(|(p, _)| *p == path) {
                        Some((_, body)) => {
                            let mut r = format!(
                                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            r.extend_from_slice(body);
                            r
                        }
                        None => b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                            .to_vec(),
                    };
                    let _ = stream.write_all(&response).await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn allowed_entry_overrides_blocked_entry() {
        let blocker = blocker(ListSources {
            blacklist: vec!["ads.example".into(), "both.example".into()],
            whitelist: vec!["both.example".into()],
            ..Default::default()
        });
        blocker.refresh().await;

        assert!(blocker.is_blocked("ads.example"));
        assert!(!blocker.is_blocked("both.example"));
        assert!(!blocker.is_blocked("safe.example"));
    }

    #[tokio::test]
    async fn blocked_query_short_circuits_with_empty_answer() {
        let blocker = blocker(ListSources {
            blacklist: vec!["ads.example".into()],
            ..Default::default()
        });
        blocker.refresh().await;
        let cache = Arc::new(CachePlugin::new(Arc::new(Metrics::new().unwrap())));
        let mut builder = ChainBuilder::new();
        builder.register(blocker.clone());
        builder.register(cache.clone());
        let chain = builder.build();

        let mut req = Request::new(
            Arc::new(NullConn),
            "127.0.0.1:5353".parse().unwrap(),
            query(9, "ads.example."),
        );
        chain.dispatch(&mut req).await.unwrap();

        assert!(dns::is_response(&req.message));
        assert!(req.message.answers().is_empty());
        assert!(cache.is_empty());
        assert_eq!(blocker.metrics.snapshot().blocked, 1);
    }

    #[tokio::test]
    async fn refresh_merges_remote_lists_and_survives_failures() {
        let base = serve_lists(vec![
            ("/block.txt", &b"# ads\nremote-ads.example\n\n;x\ntracker.example\n"[..]),
            ("/allow.txt", &b"tracker.example\n"[..]),
            ("/binary.txt", &b"\xff\xfe\x00"[..]),
        ])
        .await;
        let blocker = blocker(ListSources {
            blacklist: vec!["static.example".into()],
            blocklists: vec![
                format!("{base}/block.txt"),
                format!("{base}/missing.txt"),
                format!("{base}/binary.txt"),
                "http://127.0.0.1:1/unreachable".into(),
            ],
            whitelists: vec![format!("{base}/allow.txt")],
            ..Default::default()
        });

        blocker.refresh().await;

        assert_eq!(blocker.blocked_count(), 3);
        assert_eq!(blocker.allowed_count(), 1);
        assert!(blocker.is_blocked("remote-ads.example"));
        assert!(blocker.is_blocked("static.example"));
        assert!(!blocker.is_blocked("tracker.example"));
        let snapshot = blocker.metrics.snapshot();
        assert_eq!(snapshot.adblock_updates, 1);
        assert_eq!(snapshot.blacklist, 3);
        assert_eq!(snapshot.whitelist, 1);
    }

    #[tokio::test]
    async fn list_hosts_resolve_through_forwarder_lookup() {
        let base = serve_lists(vec![("/block.txt", &b"remote-ads.example\n"[..])]).await;
        let port = base.rsplit(':').next().unwrap();
        let upstream = hosts_upstream(Ipv4Addr::LOCALHOST).await;
        let blocker = AdBlockPlugin::new(
            ListSources {
                blocklists: vec![format!("http://lists.example:{port}/block.txt")],
                ..Default::default()
            },
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap()
        .with_lookup(Arc::new(ForwarderLookup::new(upstream)))
        .unwrap();

        blocker.refresh().await;

        assert!(blocker.is_blocked("remote-ads.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_job_waits_for_readiness_then_runs_hourly() {
        let blocker = blocker(ListSources {
            blacklist: vec!["ads.example".into()],
            ..Default::default()
        });
        let updates = || blocker.metrics.snapshot().adblock_updates;
        let readiness = Readiness::new();
        let handle = blocker.start(readiness.clone());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(blocker.blocked_count(), 0);
        assert_eq!(updates(), 0);

        readiness.mark_ready();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(blocker.is_blocked("ads.example"));
        assert_eq!(updates(), 1);

        tokio::time::sleep(REFRESH_INTERVAL - Duration::from_millis(200)).await;
        assert_eq!(updates(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(updates(), 2);

        tokio::time::sleep(REFRESH_INTERVAL).await;
        assert_eq!(updates(), 3);
        handle.abort();
    }
}
