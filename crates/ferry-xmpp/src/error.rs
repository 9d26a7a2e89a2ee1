//! Error taxonomy for connection establishment and stream negotiation.
//!
//! Every failure carries a category and a condition code so callers can render
//! a specific message without inspecting the free-text detail.

use std::fmt;

use minidom::Element;
use thiserror::Error;

use crate::parser::ns;

/// Failure to produce a usable byte stream to the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("unable to connect to proxy: {0}")]
    ProxyConnect(String),

    #[error("proxy negotiation failed: {0}")]
    ProxyNegotiate(String),

    #[error("proxy authentication failed: {0}")]
    ProxyAuth(String),

    #[error("stream error: {0}")]
    StreamError(String),
}

impl ConnectionError {
    pub fn condition(&self) -> ConnectionCondition {
        match self {
            Self::ConnectionRefused(_) => ConnectionCondition::ConnectionRefused,
            Self::HostNotFound(_) => ConnectionCondition::HostNotFound,
            Self::ProxyConnect(_) => ConnectionCondition::ProxyConnect,
            Self::ProxyNegotiate(_) => ConnectionCondition::ProxyNegotiate,
            Self::ProxyAuth(_) => ConnectionCondition::ProxyAuth,
            Self::StreamError(_) => ConnectionCondition::StreamError,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::ConnectionRefused(d)
            | Self::HostNotFound(d)
            | Self::ProxyConnect(d)
            | Self::ProxyNegotiate(d)
            | Self::ProxyAuth(d)
            | Self::StreamError(d) => d,
        }
    }

    /// Proxy failures mean no candidate can succeed, so the walk stops.
    pub fn is_proxy_error(&self) -> bool {
        matches!(
            self,
            Self::ProxyConnect(_) | Self::ProxyNegotiate(_) | Self::ProxyAuth(_)
        )
    }

    /// Whether trying the next candidate could help.
    pub fn is_retryable(&self) -> bool {
        !self.is_proxy_error()
    }

    pub(crate) fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut => Self::ConnectionRefused(error.to_string()),
            ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                Self::HostNotFound(error.to_string())
            }
            _ => Self::StreamError(error.to_string()),
        }
    }
}

/// Top-level failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Connection,
    Stream,
    StreamNegotiation,
    Tls,
    Auth,
    SecurityLayer,
    Bind,
    Parse,
    Protocol,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Stream => "stream",
            Self::StreamNegotiation => "stream-negotiation",
            Self::Tls => "tls",
            Self::Auth => "auth",
            Self::SecurityLayer => "security-layer",
            Self::Bind => "bind",
            Self::Parse => "parse",
            Self::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionCondition {
    ConnectionRefused,
    HostNotFound,
    ProxyConnect,
    ProxyNegotiate,
    ProxyAuth,
    StreamError,
}

impl ConnectionCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection-refused",
            Self::HostNotFound => "host-not-found",
            Self::ProxyConnect => "proxy-connect",
            Self::ProxyNegotiate => "proxy-negotiate",
            Self::ProxyAuth => "proxy-auth",
            Self::StreamError => "stream-error",
        }
    }
}

/// `<stream:error/>` conditions that terminate an established stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamCondition {
    /// Any condition without a dedicated variant.
    Generic,
    BadFormat,
    Conflict,
    ConnectionTimeout,
    InternalServerError,
    InvalidFrom,
    InvalidXml,
    NotAuthorized,
    PolicyViolation,
    ResourceConstraint,
    RestrictedXml,
    SystemShutdown,
}

impl StreamCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "undefined-condition",
            Self::BadFormat => "bad-format",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::ResourceConstraint => "resource-constraint",
            Self::RestrictedXml => "restricted-xml",
            Self::SystemShutdown => "system-shutdown",
        }
    }
}

/// `<stream:error/>` conditions raised while the stream is being set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationCondition {
    HostGone,
    HostUnknown,
    RemoteConnectionFailed,
    /// The redirect target travels in the error text.
    SeeOtherHost,
    UnsupportedVersion,
}

impl NegotiationCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostGone => "host-gone",
            Self::HostUnknown => "host-unknown",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::SeeOtherHost => "see-other-host",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsCondition {
    StartTlsRejected,
    HandshakeFailed,
}

impl TlsCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartTlsRejected => "starttls-rejected",
            Self::HandshakeFailed => "handshake-failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthCondition {
    GenericAuthError,
    NoMechanism,
    BadProtocol,
    BadServer,
    EncryptionRequired,
    InvalidAuthzid,
    InvalidMechanism,
    InvalidRealm,
    MechanismTooWeak,
    NotAuthorized,
    TemporaryAuthFailure,
    CredentialsExpired,
    AccountDisabled,
    Aborted,
}

impl AuthCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenericAuthError => "generic-auth-error",
            Self::NoMechanism => "no-mechanism",
            Self::BadProtocol => "bad-protocol",
            Self::BadServer => "bad-server",
            Self::EncryptionRequired => "encryption-required",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::InvalidRealm => "invalid-realm",
            Self::MechanismTooWeak => "mechanism-too-weak",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
            Self::CredentialsExpired => "credentials-expired",
            Self::AccountDisabled => "account-disabled",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityLayerCondition {
    /// The TLS record layer failed after the handshake.
    Tls,
    /// The SASL encode/decode layer failed after authentication.
    Sasl,
    /// The compression layer produced or received corrupt data.
    Compression,
}

impl SecurityLayerCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls => "tls-layer",
            Self::Sasl => "sasl-layer",
            Self::Compression => "compression-layer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindCondition {
    Generic,
    NotAllowed,
    Conflict,
}

impl BindCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "bind-failed",
            Self::NotAllowed => "not-allowed",
            Self::Conflict => "conflict",
        }
    }
}

/// Condition code, grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Connection(ConnectionCondition),
    Stream(StreamCondition),
    Negotiation(NegotiationCondition),
    Tls(TlsCondition),
    Auth(AuthCondition),
    SecurityLayer(SecurityLayerCondition),
    Bind(BindCondition),
    Parse,
    Protocol,
}

impl Condition {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) => ErrorCategory::Connection,
            Self::Stream(_) => ErrorCategory::Stream,
            Self::Negotiation(_) => ErrorCategory::StreamNegotiation,
            Self::Tls(_) => ErrorCategory::Tls,
            Self::Auth(_) => ErrorCategory::Auth,
            Self::SecurityLayer(_) => ErrorCategory::SecurityLayer,
            Self::Bind(_) => ErrorCategory::Bind,
            Self::Parse => ErrorCategory::Parse,
            Self::Protocol => ErrorCategory::Protocol,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection(c) => c.as_str(),
            Self::Stream(c) => c.as_str(),
            Self::Negotiation(c) => c.as_str(),
            Self::Tls(c) => c.as_str(),
            Self::Auth(c) => c.as_str(),
            Self::SecurityLayer(c) => c.as_str(),
            Self::Bind(c) => c.as_str(),
            Self::Parse => "malformed-xml",
            Self::Protocol => "protocol-violation",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category(), self.as_str())
    }
}

/// Terminal failure of a stream session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct NegotiationError {
    pub condition: Condition,
    pub text: Option<String>,
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}: {text}", self.condition),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl NegotiationError {
    pub fn new(condition: Condition, text: Option<String>) -> Self {
        Self { condition, text }
    }

    pub fn category(&self) -> ErrorCategory {
        self.condition.category()
    }

    pub fn auth(condition: AuthCondition, text: impl Into<String>) -> Self {
        Self::new(Condition::Auth(condition), Some(text.into()))
    }

    pub fn tls(condition: TlsCondition, text: impl Into<String>) -> Self {
        Self::new(Condition::Tls(condition), Some(text.into()))
    }

    pub fn security_layer(condition: SecurityLayerCondition, text: impl Into<String>) -> Self {
        Self::new(Condition::SecurityLayer(condition), Some(text.into()))
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(Condition::Parse, Some(msg.into()))
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(Condition::Protocol, Some(msg.into()))
    }

    pub fn see_other_host(target: impl Into<String>) -> Self {
        Self::new(
            Condition::Negotiation(NegotiationCondition::SeeOtherHost),
            Some(target.into()),
        )
    }

    /// Map a received `<stream:error/>` element.
    ///
    /// Conditions without a dedicated variant land in [`StreamCondition::Generic`].
    pub fn from_stream_error(element: &Element) -> Self {
        let mut condition = Condition::Stream(StreamCondition::Generic);
        let mut name_seen = None;
        let mut text = None;

        for child in element.children() {
            if !child.is(child.name(), ns::STREAM_ERRORS) {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
                continue;
            }
            name_seen = Some(child.name().to_string());
            condition = match child.name() {
                "host-gone" => Condition::Negotiation(NegotiationCondition::HostGone),
                "host-unknown" => Condition::Negotiation(NegotiationCondition::HostUnknown),
                "remote-connection-failed" => {
                    Condition::Negotiation(NegotiationCondition::RemoteConnectionFailed)
                }
                "see-other-host" => {
                    return Self::see_other_host(child.text().trim());
                }
                "unsupported-version" => {
                    Condition::Negotiation(NegotiationCondition::UnsupportedVersion)
                }
                "bad-format" => Condition::Stream(StreamCondition::BadFormat),
                "conflict" => Condition::Stream(StreamCondition::Conflict),
                "connection-timeout" => Condition::Stream(StreamCondition::ConnectionTimeout),
                "internal-server-error" => Condition::Stream(StreamCondition::InternalServerError),
                "invalid-from" => Condition::Stream(StreamCondition::InvalidFrom),
                "invalid-xml" => Condition::Stream(StreamCondition::InvalidXml),
                "not-authorized" => Condition::Stream(StreamCondition::NotAuthorized),
                "policy-violation" => Condition::Stream(StreamCondition::PolicyViolation),
                "resource-constraint" => Condition::Stream(StreamCondition::ResourceConstraint),
                "restricted-xml" => Condition::Stream(StreamCondition::RestrictedXml),
                "system-shutdown" => Condition::Stream(StreamCondition::SystemShutdown),
                _ => Condition::Stream(StreamCondition::Generic),
            };
        }

        // Keep the unknown condition name visible when there is no text.
        let text = text.or_else(|| match condition {
            Condition::Stream(StreamCondition::Generic) => name_seen,
            _ => None,
        });
        Self::new(condition, text)
    }
}

impl From<ConnectionError> for NegotiationError {
    fn from(error: ConnectionError) -> Self {
        let condition = Condition::Connection(error.condition());
        let detail = error.detail().to_string();
        Self::new(condition, (!detail.is_empty()).then_some(detail))
    }
}

/// Misuse of the caller-facing engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no stream session is in progress")]
    NotConnected,

    #[error("nothing is waiting for {0}")]
    NothingPending(&'static str),

    #[error("invalid JID: {0}")]
    Jid(#[from] jid::Error),

    #[error("failed to serialize stanza: {0}")]
    Serialize(String),
}
