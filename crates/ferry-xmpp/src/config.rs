//! Caller-supplied policy for a connection attempt and its negotiation.
//!
//! All types deserialize with `#[serde(default)]` so a configuration file only
//! needs to name the options it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default HTTP-poll interval once the session is authenticated.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;

/// Poll interval used while logging in.
pub const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Port for servers that expect TLS from the first byte.
pub const LEGACY_SSL_PORT: u16 = 5223;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyKind {
    #[default]
    None,
    HttpConnect,
    HttpPoll,
    Socks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SocksVersion {
    #[serde(rename = "4")]
    V4,
    #[default]
    #[serde(rename = "5")]
    V5,
}

/// Proxy selection. Immutable for the duration of a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub pass: Option<String>,
    /// HTTP-poll interval once authenticated, in milliseconds.
    pub poll_interval_ms: u64,
    /// Full URL for HTTP polling; defaults to `http://{host}:{port}/`.
    pub poll_url: Option<String>,
    pub socks_version: SocksVersion,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            kind: ProxyKind::None,
            host: String::new(),
            port: 8080,
            user: None,
            pass: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_url: None,
            socks_version: SocksVersion::V5,
        }
    }
}

impl ProxyConfig {
    pub fn http_connect(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ProxyKind::HttpConnect,
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn socks(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ProxyKind::Socks,
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn http_poll(url: impl Into<String>) -> Self {
        Self {
            kind: ProxyKind::HttpPoll,
            poll_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    /// Username and password, when a username is configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.user
            .as_deref()
            .map(|user| (user, self.pass.as_deref().unwrap_or_default()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_url(&self) -> String {
        self.poll_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}/", self.host, self.port))
    }
}

/// Per-attempt connection policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Explicit host, bypassing service discovery.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Look up SRV records (with address fallback) when no host is given.
    pub probe: bool,
    /// Negotiate TLS immediately instead of STARTTLS. Honoured with an
    /// explicit host or HTTP polling.
    pub force_ssl: bool,
    /// When discovery finds nothing, try the old dedicated TLS port first.
    pub legacy_ssl_probe: bool,
    pub proxy: ProxyConfig,
    pub ssf_min: u32,
    pub ssf_max: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            probe: true,
            force_ssl: false,
            legacy_ssl_probe: false,
            proxy: ProxyConfig::default(),
            ssf_min: 0,
            ssf_max: 256,
        }
    }
}

impl ConnectOptions {
    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }
}

/// Negotiation policy for the stream engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Permit PLAIN (and plaintext legacy auth) without TLS.
    pub allow_plain: bool,
    pub require_mutual_auth: bool,
    /// Skip SASL and use jabber:iq:auth.
    pub old_protocol_only: bool,
    /// Whitespace keepalive interval once active; 0 disables it.
    pub noop_interval_ms: u64,
    pub compress: bool,
    pub resource_binding: bool,
    /// Use exactly this SASL mechanism.
    pub sasl_mechanism: Option<String>,
    /// Send the initial response inside `<auth/>`.
    pub allow_client_first: bool,
    pub lang: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            allow_plain: false,
            require_mutual_auth: false,
            old_protocol_only: false,
            noop_interval_ms: 0,
            compress: false,
            resource_binding: true,
            sasl_mechanism: None,
            allow_client_first: true,
            lang: None,
        }
    }
}

impl StreamOptions {
    pub fn noop_interval(&self) -> Duration {
        Duration::from_millis(self.noop_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_require_a_user() {
        let proxy = ProxyConfig::http_connect("proxy.local", 3128);
        assert_eq!(proxy.credentials(), None);

        let proxy = proxy.with_credentials("bob", "hunter2");
        assert_eq!(proxy.credentials(), Some(("bob", "hunter2")));
    }

    #[test]
    fn poll_url_defaults_to_proxy_address() {
        let mut proxy = ProxyConfig::default();
        proxy.kind = ProxyKind::HttpPoll;
        proxy.host = "poll.example.com".to_string();
        proxy.port = 80;
        assert_eq!(proxy.poll_url(), "http://poll.example.com:80/");
        assert_eq!(proxy.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn defaults_probe_without_ssl() {
        let options = ConnectOptions::default();
        assert!(options.probe);
        assert!(!options.force_ssl);
        assert_eq!((options.ssf_min, options.ssf_max), (0, 256));
        assert!(StreamOptions::default().resource_binding);
    }
}
