//! DNS SRV service discovery for the client connection.
//!
//! The resolution process:
//! 1. Query `_{service}._{proto}.{domain}` for SRV records
//! 2. Order the targets by priority, then weight, both ascending
//! 3. On timeout or an empty answer, fall back to plain address resolution
//!    of the domain itself
//!
//! The weight tie-break deliberately prefers the lower weight.

pub mod lookup;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, instrument, warn};

pub use lookup::{LookupHandle, LookupRegistry, PendingLookup};

/// Default client port, RFC 6120 section 3.2.
pub const DEFAULT_CLIENT_PORT: u16 = 5222;

/// Bound on the whole SRV phase.
pub const SRV_TIMEOUT: Duration = Duration::from_secs(15);

/// One SRV answer as received from DNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// A host:port the connector may try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCandidate {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

impl ServiceCandidate {
    pub fn new(host: impl Into<String>, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight,
        }
    }

    /// Candidate produced by plain address resolution.
    pub fn fallback(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, 0, 0)
    }
}

impl std::fmt::Display for ServiceCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Source of SRV answers.
#[cfg_attr(test, automock)]
pub trait SrvSource: Send + Sync {
    fn lookup_srv(&self, name: &str) -> BoxFuture<'static, Result<Vec<SrvRecord>, String>>;
}

/// Type alias for the Tokio-based resolver.
pub type TokioResolver = Resolver<TokioConnectionProvider>;

/// SRV lookups through hickory-resolver.
#[derive(Clone)]
pub struct HickorySrvSource {
    resolver: Arc<TokioResolver>,
}

impl HickorySrvSource {
    pub fn new() -> Self {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self {
            resolver: Arc::new(resolver),
        }
    }
}

impl Default for HickorySrvSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SrvSource for HickorySrvSource {
    fn lookup_srv(&self, name: &str) -> BoxFuture<'static, Result<Vec<SrvRecord>, String>> {
        let resolver = Arc::clone(&self.resolver);
        let name = name.to_string();
        Box::pin(async move {
            let answer = resolver
                .srv_lookup(name.as_str())
                .await
                .map_err(|e| e.to_string())?;
            Ok(answer
                .iter()
                .map(|srv| SrvRecord {
                    target: srv.target().to_utf8(),
                    port: srv.port(),
                    priority: srv.priority(),
                    weight: srv.weight(),
                })
                .collect())
        })
    }
}

/// Resolves a domain to the ordered candidates the connector walks.
pub struct ServiceResolver<S = HickorySrvSource> {
    source: S,
    lookups: LookupRegistry,
    timeout: Duration,
    fallback_port: u16,
}

impl ServiceResolver<HickorySrvSource> {
    pub fn system(lookups: LookupRegistry) -> Self {
        Self::new(HickorySrvSource::new(), lookups)
    }
}

impl<S: SrvSource> ServiceResolver<S> {
    pub fn new(source: S, lookups: LookupRegistry) -> Self {
        Self {
            source,
            lookups,
            timeout: SRV_TIMEOUT,
            fallback_port: DEFAULT_CLIENT_PORT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fallback_port(mut self, port: u16) -> Self {
        self.fallback_port = port;
        self
    }

    pub fn lookups(&self) -> &LookupRegistry {
        &self.lookups
    }

    /// Resolve `domain` for `_{service}._{proto}`.
    ///
    /// An empty list means no candidates; failure is never reported any other way.
    #[instrument(skip(self), name = "dns.resolve_service")]
    pub async fn resolve(&self, domain: &str, service: &str, proto: &str) -> Vec<ServiceCandidate> {
        match self.resolve_srv(domain, service, proto).await {
            Some(candidates) => candidates,
            None => self.resolve_fallback(domain).await,
        }
    }

    /// SRV phase only. `None` when the query failed, timed out or had no
    /// usable targets.
    pub async fn resolve_srv(
        &self,
        domain: &str,
        service: &str,
        proto: &str,
    ) -> Option<Vec<ServiceCandidate>> {
        let srv_name = format!("_{service}._{proto}.{domain}");
        debug!(srv_name = %srv_name, "resolving SRV records");

        match tokio::time::timeout(self.timeout, self.source.lookup_srv(&srv_name)).await {
            Ok(Ok(records)) => {
                let candidates = order_candidates(process_srv_records(records));
                if !candidates.is_empty() {
                    debug!(count = candidates.len(), "resolved SRV candidates");
                    return Some(candidates);
                }
                debug!("no usable SRV records, falling back to address lookup");
            }
            Ok(Err(error)) => {
                debug!(error = %error, "SRV lookup failed, falling back to address lookup");
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "SRV lookup timed out, falling back to address lookup");
            }
        }
        None
    }

    /// Plain address resolution of `domain`, as at most one candidate.
    #[instrument(skip(self), name = "dns.resolve_fallback")]
    pub async fn resolve_fallback(&self, domain: &str) -> Vec<ServiceCandidate> {
        match self.lookups.lookup(domain, self.fallback_port).await {
            Ok(addrs) => {
                debug!(count = addrs.len(), "fallback address lookup succeeded");
                vec![ServiceCandidate::fallback(domain, self.fallback_port)]
            }
            Err(error) => {
                warn!(error = %error, domain = %domain, "fallback address lookup failed");
                Vec::new()
            }
        }
    }
}

fn process_srv_records(records: Vec<SrvRecord>) -> Vec<ServiceCandidate> {
    records
        .into_iter()
        .filter_map(|srv| {
            // "." means the service is decidedly not available at this domain.
            if srv.target == "." || srv.target.is_empty() {
                return None;
            }
            let host = srv.target.trim_end_matches('.');
            Some(ServiceCandidate::new(host, srv.port, srv.priority, srv.weight))
        })
        .collect()
}

/// Repeatedly extract the minimum by `(priority, weight)`.
///
/// Equivalent to a stable ascending sort on that pair; equal pairs keep their
/// DNS answer order.
pub fn order_candidates(mut candidates: Vec<ServiceCandidate>) -> Vec<ServiceCandidate> {
    candidates.sort_by_key(|c| (c.priority, c.weight));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(target: &str, port: u16, priority: u16, weight: u16) -> SrvRecord {
        SrvRecord {
            target: target.to_string(),
            port,
            priority,
            weight,
        }
    }

    fn resolver(source: MockSrvSource) -> ServiceResolver<MockSrvSource> {
        ServiceResolver::new(source, LookupRegistry::init())
    }

    #[test]
    fn orders_by_priority_then_ascending_weight() {
        let ordered = order_candidates(vec![
            ServiceCandidate::new("c", 5222, 10, 20),
            ServiceCandidate::new("a", 5222, 5, 10),
            ServiceCandidate::new("b", 5222, 5, 30),
        ]);

        let keys: Vec<_> = ordered.iter().map(|c| (c.priority, c.weight)).collect();
        assert_eq!(keys, vec![(5, 10), (5, 30), (10, 20)]);
    }

    #[test]
    fn equal_keys_keep_answer_order() {
        let ordered = order_candidates(vec![
            ServiceCandidate::new("first", 5222, 1, 1),
            ServiceCandidate::new("second", 5222, 1, 1),
        ]);
        assert_eq!(ordered[0].host, "first");
        assert_eq!(ordered[1].host, "second");
    }

    #[test]
    fn root_target_is_skipped_and_dots_trimmed() {
        let candidates = process_srv_records(vec![
            record(".", 5222, 0, 0),
            record("xmpp.example.com.", 5223, 1, 0),
        ]);
        assert_eq!(candidates, vec![ServiceCandidate::new("xmpp.example.com", 5223, 1, 0)]);
    }

    #[tokio::test]
    async fn srv_answers_are_ordered() {
        let mut source = MockSrvSource::new();
        source
            .expect_lookup_srv()
            .withf(|name| name == "_xmpp-client._tcp.example.com")
            .times(1)
            .returning(|_| {
                Box::pin(async {
                    Ok(vec![
                        record("c.example.com.", 5222, 10, 20),
                        record("a.example.com.", 5222, 5, 10),
                        record("b.example.com.", 5222, 5, 30),
                    ])
                })
            });

        let candidates = resolver(source)
            .resolve("example.com", "xmpp-client", "tcp")
            .await;
        let hosts: Vec<_> = candidates.iter().map(|c| c.host.as_str()).collect();
        assert_eq!(hosts, vec!["a.example.com", "b.example.com", "c.example.com"]);
    }

    #[tokio::test]
    async fn empty_answer_falls_back_to_one_candidate() {
        let mut source = MockSrvSource::new();
        source
            .expect_lookup_srv()
            .returning(|_| Box::pin(async { Ok(Vec::new()) }));

        let candidates = resolver(source).resolve("127.0.0.1", "xmpp-client", "tcp").await;
        assert_eq!(candidates, vec![ServiceCandidate::fallback("127.0.0.1", 5222)]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back_to_one_candidate() {
        let mut source = MockSrvSource::new();
        source
            .expect_lookup_srv()
            .returning(|_| Box::pin(futures::future::pending()));

        let candidates = resolver(source).resolve("127.0.0.1", "xmpp-client", "tcp").await;
        assert_eq!(candidates, vec![ServiceCandidate::fallback("127.0.0.1", 5222)]);
    }

    #[tokio::test]
    async fn failed_fallback_yields_no_candidates() {
        let mut source = MockSrvSource::new();
        source
            .expect_lookup_srv()
            .returning(|_| Box::pin(async { Err("NXDOMAIN".to_string()) }));

        let lookups = LookupRegistry::init();
        lookups.shutdown();
        let candidates = ServiceResolver::new(source, lookups)
            .resolve("example.invalid", "xmpp-client", "tcp")
            .await;
        assert!(candidates.is_empty());
    }
}
