//! Turns a server domain plus [`ConnectOptions`] into one connected transport.
//!
//! Candidates are tried strictly one at a time, in resolver order, and each
//! candidate gets exactly one attempt.

use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectOptions, ProxyKind, LEGACY_SSL_PORT};
use crate::error::ConnectionError;
use crate::proxy::{Dial, ProxyTunnel, Transport};
use crate::resolver::{
    HickorySrvSource, LookupRegistry, ServiceCandidate, ServiceResolver, SrvSource,
    DEFAULT_CLIENT_PORT,
};

pub const XMPP_CLIENT_SERVICE: &str = "xmpp-client";

/// Everything the connector needs for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// The JID's domain part.
    pub domain: String,
    pub options: ConnectOptions,
}

impl ConnectRequest {
    pub fn new(domain: impl Into<String>, options: ConnectOptions) -> Self {
        Self {
            domain: domain.into(),
            options,
        }
    }
}

/// A usable byte stream and how it was reached.
#[derive(Debug)]
pub struct Connection {
    pub transport: Transport,
    /// TLS must start before the first stream byte.
    pub ssl: bool,
    pub candidate: ServiceCandidate,
}

/// One entry of the walk: where to go and whether TLS starts immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub candidate: ServiceCandidate,
    pub ssl: bool,
}

pub struct Connector<D = ProxyTunnel, S = HickorySrvSource> {
    dial: D,
    resolver: ServiceResolver<S>,
}

impl Connector {
    /// Production connector sharing `lookups` between DNS fallback and TCP.
    pub fn new(lookups: LookupRegistry) -> Self {
        Self {
            dial: ProxyTunnel::new(lookups.clone()),
            resolver: ServiceResolver::system(lookups),
        }
    }
}

impl<D: Dial, S: SrvSource> Connector<D, S> {
    pub fn with_parts(dial: D, resolver: ServiceResolver<S>) -> Self {
        Self { dial, resolver }
    }

    pub fn lookups(&self) -> &LookupRegistry {
        self.resolver.lookups()
    }

    #[instrument(skip(self, request), fields(domain = %request.domain), name = "connector.connect")]
    pub async fn connect(&self, request: &ConnectRequest) -> Result<Connection, ConnectionError> {
        let attempts = self.plan(request).await;
        if attempts.is_empty() {
            warn!("no connection candidates");
            return Err(ConnectionError::HostNotFound(format!(
                "no servers found for {}",
                request.domain
            )));
        }

        let mut all_not_found = true;
        let mut last_error = None;
        for Attempt { candidate, ssl } in attempts {
            debug!(candidate = %candidate, ssl, "trying candidate");
            match self.dial.dial(&candidate, &request.options.proxy).await {
                Ok(transport) => {
                    info!(candidate = %candidate, ssl, "connected");
                    return Ok(Connection {
                        transport,
                        ssl,
                        candidate,
                    });
                }
                Err(error) if !error.is_retryable() => {
                    warn!(candidate = %candidate, error = %error, "proxy failure, giving up");
                    return Err(error);
                }
                Err(error) => {
                    debug!(candidate = %candidate, error = %error, "candidate failed");
                    all_not_found &= matches!(error, ConnectionError::HostNotFound(_));
                    last_error = Some(error);
                }
            }
        }

        let detail = last_error
            .map(|e| e.detail().to_string())
            .unwrap_or_default();
        warn!(detail = %detail, "all candidates failed");
        if all_not_found {
            Err(ConnectionError::HostNotFound(detail))
        } else {
            Err(ConnectionError::ConnectionRefused(detail))
        }
    }

    /// Ordered attempts for `request`.
    pub async fn plan(&self, request: &ConnectRequest) -> Vec<Attempt> {
        let options = &request.options;
        let port = options.port.unwrap_or(DEFAULT_CLIENT_PORT);

        if let Some(host) = &options.host {
            return vec![Attempt {
                candidate: ServiceCandidate::fallback(host.as_str(), port),
                ssl: options.force_ssl,
            }];
        }

        // The proxy resolves the name itself, and SRV answers from our
        // resolver may not be reachable from it.
        if options.proxy.kind == ProxyKind::HttpConnect {
            return vec![Attempt {
                candidate: ServiceCandidate::fallback(request.domain.as_str(), DEFAULT_CLIENT_PORT),
                ssl: options.force_ssl,
            }];
        }

        // The poll endpoint carries the stream, so DNS has nothing to choose.
        if options.proxy.kind == ProxyKind::HttpPoll {
            return vec![Attempt {
                candidate: ServiceCandidate::fallback(request.domain.as_str(), port),
                ssl: options.force_ssl,
            }];
        }

        if !options.probe {
            return vec![Attempt {
                candidate: ServiceCandidate::fallback(request.domain.as_str(), port),
                ssl: false,
            }];
        }

        if let Some(candidates) = self
            .resolver
            .resolve_srv(&request.domain, XMPP_CLIENT_SERVICE, "tcp")
            .await
        {
            return candidates
                .into_iter()
                .map(|candidate| Attempt {
                    candidate,
                    ssl: false,
                })
                .collect();
        }

        let mut attempts = Vec::new();
        if options.legacy_ssl_probe {
            attempts.push(Attempt {
                candidate: ServiceCandidate::fallback(request.domain.as_str(), LEGACY_SSL_PORT),
                ssl: true,
            });
        }
        attempts.extend(
            self.resolver
                .resolve_fallback(&request.domain)
                .await
                .into_iter()
                .map(|candidate| Attempt {
                    candidate,
                    ssl: false,
                }),
        );
        attempts
    }
}

#[cfg(test)]
mod tests {
    use mockall::Sequence;

    use super::*;
    use crate::config::ProxyConfig;
    use crate::proxy::MockDial;
    use crate::resolver::{MockSrvSource, SrvRecord};

    fn srv(targets: &'static [&'static str]) -> MockSrvSource {
        let mut source = MockSrvSource::new();
        source.expect_lookup_srv().returning(move |_| {
            Box::pin(async move {
                Ok(targets
                    .iter()
                    .enumerate()
                    .map(|(i, target)| SrvRecord {
                        target: format!("{target}."),
                        port: 5222,
                        priority: i as u16,
                        weight: 0,
                    })
                    .collect())
            })
        });
        source
    }

    fn connector(dial: MockDial, source: MockSrvSource) -> Connector<MockDial, MockSrvSource> {
        Connector::with_parts(dial, ServiceResolver::new(source, LookupRegistry::init()))
    }

    fn request(options: ConnectOptions) -> ConnectRequest {
        ConnectRequest::new("example.com", options)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn every_refused_candidate_is_tried_once_in_order() {
        let mut dial = MockDial::new();
        let mut seq = Sequence::new();
        for host in ["a.example.com", "b.example.com", "c.example.com"] {
            dial.expect_dial()
                .withf(move |candidate, _| candidate.host == host)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|candidate, _| {
                    let detail = format!("{candidate} refused");
                    Box::pin(async move { Err(ConnectionError::ConnectionRefused(detail)) })
                });
        }

        let connector = connector(dial, srv(&["a.example.com", "b.example.com", "c.example.com"]));
        let error = connector
            .connect(&request(ConnectOptions::default()))
            .await
            .unwrap_err();

        assert_eq!(
            error,
            ConnectionError::ConnectionRefused("c.example.com:5222 refused".to_string())
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn first_success_wins() {
        let mut dial = MockDial::new();
        let mut seq = Sequence::new();
        dial.expect_dial()
            .withf(|candidate, _| candidate.host == "a.example.com")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Box::pin(async { Err(ConnectionError::HostNotFound("a".to_string())) })
            });
        dial.expect_dial()
            .withf(|candidate, _| candidate.host == "b.example.com")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Box::pin(async { Ok(Transport::in_memory(64).0) }));

        let connector = connector(dial, srv(&["a.example.com", "b.example.com", "c.example.com"]));
        let connection = connector
            .connect(&request(ConnectOptions::default()))
            .await
            .unwrap();
        assert_eq!(connection.candidate.host, "b.example.com");
        assert!(!connection.ssl);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn proxy_failure_stops_the_walk() {
        let mut dial = MockDial::new();
        dial.expect_dial()
            .times(1)
            .returning(|_, _| Box::pin(async { Err(ConnectionError::ProxyAuth("407".to_string())) }));

        let mut options = ConnectOptions::default();
        options.proxy = ProxyConfig::socks("proxy.local", 1080);
        let connector = connector(dial, srv(&["a.example.com", "b.example.com"]));
        let error = connector.connect(&request(options)).await.unwrap_err();
        assert!(matches!(error, ConnectionError::ProxyAuth(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn all_unknown_hosts_aggregate_to_host_not_found() {
        let mut dial = MockDial::new();
        dial.expect_dial().times(2).returning(|_, _| {
            Box::pin(async { Err(ConnectionError::HostNotFound("nx".to_string())) })
        });

        let connector = connector(dial, srv(&["a.example.com", "b.example.com"]));
        let error = connector
            .connect(&request(ConnectOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(error, ConnectionError::HostNotFound(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn explicit_host_skips_discovery() {
        let mut source = MockSrvSource::new();
        source.expect_lookup_srv().never();
        let mut dial = MockDial::new();
        dial.expect_dial()
            .withf(|candidate, _| candidate.host == "10.0.0.5" && candidate.port == 5223)
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(Transport::in_memory(64).0) }));

        let mut options = ConnectOptions::default().with_host("10.0.0.5", 5223);
        options.force_ssl = true;
        let connection = connector(dial, source)
            .connect(&request(options))
            .await
            .unwrap();
        assert!(connection.ssl);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn force_ssl_is_ignored_for_discovered_candidates() {
        let connector = connector(MockDial::new(), srv(&["a.example.com"]));
        let mut options = ConnectOptions::default();
        options.force_ssl = true;
        let attempts = connector.plan(&request(options)).await;
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].ssl);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn legacy_ssl_probe_precedes_address_fallback() {
        let mut source = MockSrvSource::new();
        source
            .expect_lookup_srv()
            .returning(|_| Box::pin(async { Ok(Vec::new()) }));
        let connector = connector(MockDial::new(), source);

        let mut options = ConnectOptions::default();
        options.legacy_ssl_probe = true;
        let attempts = connector
            .plan(&ConnectRequest::new("127.0.0.1", options))
            .await;

        assert_eq!(
            attempts,
            vec![
                Attempt {
                    candidate: ServiceCandidate::fallback("127.0.0.1", 5223),
                    ssl: true,
                },
                Attempt {
                    candidate: ServiceCandidate::fallback("127.0.0.1", 5222),
                    ssl: false,
                },
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn http_poll_uses_a_single_candidate() {
        let mut source = MockSrvSource::new();
        source.expect_lookup_srv().never();
        let connector = connector(MockDial::new(), source);

        let mut options = ConnectOptions::default();
        options.proxy = ProxyConfig::http_poll("http://poll.example.com/");
        let attempts = connector.plan(&request(options)).await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].candidate.host, "example.com");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn http_connect_leaves_resolution_to_the_proxy() {
        let mut source = MockSrvSource::new();
        source.expect_lookup_srv().never();
        let mut dial = MockDial::new();
        dial.expect_dial()
            .withf(|candidate, proxy| {
                candidate.host == "example.com"
                    && candidate.port == 5222
                    && proxy.kind == ProxyKind::HttpConnect
            })
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(Transport::in_memory(64).0) }));

        let mut options = ConnectOptions::default();
        options.proxy = ProxyConfig::http_connect("proxy.local", 3128);
        let connection = connector(dial, source)
            .connect(&request(options))
            .await
            .unwrap();
        assert_eq!(connection.candidate.to_string(), "example.com:5222");
        assert!(!connection.ssl);
    }
}
