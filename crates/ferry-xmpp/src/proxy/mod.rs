//! Byte-stream tunnels to a server candidate, optionally through a proxy.
//!
//! Every variant ends in a [`Transport`] implementing [`ByteStream`]:
//! - direct TCP
//! - TCP through an HTTP `CONNECT` proxy
//! - TCP through a SOCKS4a/SOCKS5 proxy
//! - HTTP polling, which buffers request/response cycles behind the same contract

pub mod http_connect;
pub mod http_poll;
pub mod socks;

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::config::{ProxyConfig, ProxyKind, SocksVersion};
use crate::error::ConnectionError;
use crate::resolver::{LookupRegistry, ServiceCandidate};

pub use http_poll::HttpPollStream;

const READ_CHUNK: usize = 16 * 1024;

/// Reliable ordered byte stream to the server.
pub trait ByteStream: Send + 'static {
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Next chunk of bytes. An empty chunk means the peer closed the stream.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Only meaningful for polling transports.
    fn set_poll_interval(&mut self, _interval: Duration) {}
}

/// Anything a tunnel can be layered over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A persistent stream, plus bytes a proxy handshake read past its own reply.
pub struct Tunnel {
    io: Box<dyn AsyncStream>,
    prefetched: Vec<u8>,
}

impl Tunnel {
    pub fn new(io: impl AsyncStream + 'static) -> Self {
        Self {
            io: Box::new(io),
            prefetched: Vec::new(),
        }
    }

    pub fn with_prefetched(io: impl AsyncStream + 'static, prefetched: Vec<u8>) -> Self {
        Self {
            io: Box::new(io),
            prefetched,
        }
    }
}

impl ByteStream for Tunnel {
    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.io
            .write_all(data)
            .await
            .map_err(|e| ConnectionError::StreamError(e.to_string()))?;
        self.io
            .flush()
            .await
            .map_err(|e| ConnectionError::StreamError(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        if !self.prefetched.is_empty() {
            return Ok(std::mem::take(&mut self.prefetched));
        }
        let mut buf = vec![0u8; READ_CHUNK];
        let n = self
            .io
            .read(&mut buf)
            .await
            .map_err(|e| ConnectionError::StreamError(e.to_string()))?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.io
            .shutdown()
            .await
            .map_err(|e| ConnectionError::StreamError(e.to_string()))
    }
}

/// The byte stream handed from the connector to the engine driver.
pub enum Transport {
    Stream(Tunnel),
    HttpPoll(HttpPollStream),
}

impl Transport {
    /// An in-process pipe; the other end plays the server.
    pub fn in_memory(capacity: usize) -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(capacity);
        (Self::Stream(Tunnel::new(client)), server)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("Transport::Stream"),
            Self::HttpPoll(_) => f.write_str("Transport::HttpPoll"),
        }
    }
}

impl ByteStream for Transport {
    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        match self {
            Self::Stream(tunnel) => tunnel.send(data).await,
            Self::HttpPoll(poll) => poll.send(data).await,
        }
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        match self {
            Self::Stream(tunnel) => tunnel.recv().await,
            Self::HttpPoll(poll) => poll.recv().await,
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match self {
            Self::Stream(tunnel) => tunnel.close().await,
            Self::HttpPoll(poll) => poll.close().await,
        }
    }

    fn set_poll_interval(&mut self, interval: Duration) {
        if let Self::HttpPoll(poll) = self {
            poll.set_poll_interval(interval);
        }
    }
}

/// Opens a transport to one candidate. Each call is a single attempt.
#[cfg_attr(test, automock)]
pub trait Dial: Send + Sync {
    fn dial(
        &self,
        candidate: &ServiceCandidate,
        proxy: &ProxyConfig,
    ) -> BoxFuture<'static, Result<Transport, ConnectionError>>;
}

/// Production [`Dial`] implementation.
#[derive(Debug, Clone)]
pub struct ProxyTunnel {
    lookups: LookupRegistry,
}

impl ProxyTunnel {
    pub fn new(lookups: LookupRegistry) -> Self {
        Self { lookups }
    }

    #[instrument(skip(self, candidate, proxy), fields(candidate = %candidate, proxy = ?proxy.kind), name = "tunnel.connect")]
    pub async fn connect(
        &self,
        candidate: &ServiceCandidate,
        proxy: &ProxyConfig,
    ) -> Result<Transport, ConnectionError> {
        match proxy.kind {
            ProxyKind::None => {
                let stream = tcp_connect(&self.lookups, &candidate.host, candidate.port).await?;
                Ok(Transport::Stream(Tunnel::new(stream)))
            }
            ProxyKind::HttpConnect => {
                let mut stream = proxy_connect(&self.lookups, proxy).await?;
                let prefetched = http_connect::negotiate(
                    &mut stream,
                    &candidate.host,
                    candidate.port,
                    proxy.credentials(),
                )
                .await?;
                Ok(Transport::Stream(Tunnel::with_prefetched(stream, prefetched)))
            }
            ProxyKind::Socks => {
                let mut stream = proxy_connect(&self.lookups, proxy).await?;
                match proxy.socks_version {
                    SocksVersion::V5 => {
                        socks::negotiate_v5(
                            &mut stream,
                            &candidate.host,
                            candidate.port,
                            proxy.credentials(),
                        )
                        .await?
                    }
                    SocksVersion::V4 => {
                        let user = proxy.user.as_deref().unwrap_or_default();
                        socks::negotiate_v4a(&mut stream, &candidate.host, candidate.port, user)
                            .await?
                    }
                }
                Ok(Transport::Stream(Tunnel::new(stream)))
            }
            ProxyKind::HttpPoll => {
                let poll = HttpPollStream::connect(proxy).await?;
                Ok(Transport::HttpPoll(poll))
            }
        }
    }
}

impl Dial for ProxyTunnel {
    fn dial(
        &self,
        candidate: &ServiceCandidate,
        proxy: &ProxyConfig,
    ) -> BoxFuture<'static, Result<Transport, ConnectionError>> {
        let tunnel = self.clone();
        let candidate = candidate.clone();
        let proxy = proxy.clone();
        Box::pin(async move { tunnel.connect(&candidate, &proxy).await })
    }
}

/// Resolve through the blocking lookup pool, then try each address in turn.
async fn tcp_connect(
    lookups: &LookupRegistry,
    host: &str,
    port: u16,
) -> Result<TcpStream, ConnectionError> {
    let addrs = lookups.lookup(host, port).await?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                debug!(%addr, "TCP connection established");
                return Ok(stream);
            }
            Err(error) => {
                debug!(%addr, error = %error, "TCP connect failed");
                last_error = Some(ConnectionError::from_io(&error));
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| ConnectionError::HostNotFound(format!("no addresses for {host}"))))
}

/// Reaching the proxy itself; any failure is a proxy-connect failure.
async fn proxy_connect(
    lookups: &LookupRegistry,
    proxy: &ProxyConfig,
) -> Result<TcpStream, ConnectionError> {
    tcp_connect(lookups, &proxy.host, proxy.port)
        .await
        .map_err(|e| ConnectionError::ProxyConnect(format!("{}:{}: {e}", proxy.host, proxy.port)))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn tunnel_returns_prefetched_bytes_first() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut tunnel = Tunnel::with_prefetched(client, b"<stream".to_vec());

        server.write_all(b":stream>").await.unwrap();
        assert_eq!(tunnel.recv().await.unwrap(), b"<stream");
        assert_eq!(tunnel.recv().await.unwrap(), b":stream>");
    }

    #[tokio::test]
    async fn closed_peer_yields_empty_chunk() {
        let (mut transport, server) = Transport::in_memory(64);
        drop(server);
        assert!(transport.recv().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn direct_connect_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let tunnel = ProxyTunnel::new(LookupRegistry::init());
        let mut transport = tunnel
            .connect(
                &ServiceCandidate::fallback("127.0.0.1", port),
                &ProxyConfig::default(),
            )
            .await
            .unwrap();
        transport.send(b"hello").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn refused_direct_connect_maps_to_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let tunnel = ProxyTunnel::new(LookupRegistry::init());
        let result = tunnel
            .connect(
                &ServiceCandidate::fallback("127.0.0.1", port),
                &ProxyConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(ConnectionError::ConnectionRefused(_))));
    }

    #[tokio::test]
    async fn unreachable_proxy_is_a_proxy_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let tunnel = ProxyTunnel::new(LookupRegistry::init());
        let result = tunnel
            .connect(
                &ServiceCandidate::fallback("xmpp.example.com", 5222),
                &ProxyConfig::http_connect("127.0.0.1", port),
            )
            .await;
        assert!(matches!(result, Err(ConnectionError::ProxyConnect(_))));
    }
}
