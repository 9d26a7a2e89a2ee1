//! Client-side XMPP connection establishment and stream negotiation.
//!
//! [`Connector`] finds and reaches a server (SRV discovery, proxies, HTTP
//! polling). [`StreamEngine`] negotiates the stream over whatever bytes it is
//! given: STARTTLS, SASL or legacy `jabber:iq:auth`, resource binding and
//! compression. [`Client`] glues the two together on tokio.

pub mod client;
pub mod compress;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod parser;
pub mod proxy;
pub mod resolver;
pub mod sasl;
pub mod tls;

pub use client::{Client, ClientEvent};
pub use config::{ConnectOptions, ProxyConfig, ProxyKind, SocksVersion, StreamOptions};
pub use connector::{ConnectRequest, Connection, Connector};
pub use engine::{Command, Input, Layer, SessionId, Signal, State, StreamEngine, Warning};
pub use error::{
    AuthCondition, BindCondition, Condition, ConnectionError, EngineError, ErrorCategory,
    NegotiationError,
};
pub use proxy::{ByteStream, Dial, ProxyTunnel, Transport};
pub use resolver::{HickorySrvSource, LookupRegistry, ServiceCandidate, SrvRecord, SrvSource};
pub use sasl::SelectedMechanism;
pub use tls::{PeerIdentity, TlsSettings};
