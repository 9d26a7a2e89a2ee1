//! Tokio driver for [`StreamEngine`].
//!
//! [`Client`] owns the transport, runs connect attempts and the keepalive
//! timer, and turns engine commands into I/O. Callers pull
//! [`ClientEvent`]s with [`Client::next_event`] and answer checkpoints
//! through the `continue_*` methods.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use minidom::Element;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectOptions, StreamOptions};
use crate::connector::{Connection, Connector};
use crate::engine::{Command, Input, SessionId, Signal, State, StreamEngine};
use crate::error::{ConnectionError, EngineError};
use crate::proxy::{ByteStream, Dial, ProxyTunnel, Transport};
use crate::resolver::{HickorySrvSource, LookupRegistry, SrvSource};
use crate::tls::{PeerIdentity, TlsSettings};

type PendingConnect = BoxFuture<'static, Result<Connection, ConnectionError>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Signal(Signal),
    Stanza(Element),
    /// TLS is up and waiting for [`Client::continue_after_handshake`].
    Handshaken(PeerIdentity),
}

pub struct Client<D = ProxyTunnel, S = HickorySrvSource> {
    engine: StreamEngine,
    connector: Arc<Connector<D, S>>,
    transport: Option<Transport>,
    connecting: Option<(SessionId, PendingConnect)>,
    keepalive: Option<Interval>,
    handshake_reported: bool,
}

impl Client {
    pub fn new(
        connect_options: ConnectOptions,
        stream_options: StreamOptions,
        tls_settings: TlsSettings,
        lookups: LookupRegistry,
    ) -> Self {
        Self::with_connector(
            StreamEngine::new(connect_options, stream_options, tls_settings),
            Connector::new(lookups),
        )
    }
}

impl<D, S> Client<D, S>
where
    D: Dial + 'static,
    S: SrvSource + 'static,
{
    pub fn with_connector(engine: StreamEngine, connector: Connector<D, S>) -> Self {
        Self {
            engine,
            connector: Arc::new(connector),
            transport: None,
            connecting: None,
            keepalive: None,
            handshake_reported: false,
        }
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    /// Direct access for setters that do not need I/O.
    pub fn engine_mut(&mut self) -> &mut StreamEngine {
        &mut self.engine
    }

    pub fn state(&self) -> State {
        self.engine.state()
    }

    #[instrument(skip(self), name = "client.connect")]
    pub async fn connect(&mut self, jid: &str) -> Result<SessionId, EngineError> {
        let session = self.engine.connect_to_server(jid)?;
        self.handshake_reported = false;
        self.run_commands().await;
        Ok(session)
    }

    /// Wait for the next event. `None` once the session is over and every
    /// queued event has been delivered.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            if let Some(signal) = self.engine.poll_signal() {
                return Some(ClientEvent::Signal(signal));
            }
            if let Some(stanza) = self.engine.read() {
                return Some(ClientEvent::Stanza(stanza));
            }
            if !self.handshake_reported {
                if let Some(identity) = self.engine.pending_handshake() {
                    self.handshake_reported = true;
                    return Some(ClientEvent::Handshaken(identity));
                }
            }
            if self.transport.is_none() && self.connecting.is_none() {
                return None;
            }

            let input = tokio::select! {
                (session, result) = wait_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(session, result)
                }
                received = recv(&mut self.transport) => match received {
                    Ok(bytes) if bytes.is_empty() => {
                        debug!("transport reached end of stream");
                        self.transport = None;
                        Some(Input::TransportClosed)
                    }
                    Ok(bytes) => Some(Input::Received(bytes)),
                    Err(error) => {
                        warn!(error = %error, "transport read failed");
                        self.transport = None;
                        Some(Input::TransportClosed)
                    }
                },
                _ = tick(&mut self.keepalive) => Some(Input::NoopTick),
            };

            if let Some(input) = input {
                self.engine.handle(input);
                self.run_commands().await;
            }
        }
    }

    pub async fn send(&mut self, stanza: &Element) -> Result<(), EngineError> {
        self.engine.write(stanza)?;
        self.run_commands().await;
        Ok(())
    }

    pub async fn send_raw(&mut self, xml: &str) -> Result<(), EngineError> {
        self.engine.write_raw(xml)?;
        self.run_commands().await;
        Ok(())
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.engine.set_password(password);
    }

    pub async fn continue_after_handshake(&mut self) -> Result<(), EngineError> {
        self.engine.continue_after_handshake()?;
        self.handshake_reported = false;
        self.run_commands().await;
        Ok(())
    }

    pub async fn continue_after_warning(&mut self) -> Result<(), EngineError> {
        self.engine.continue_after_warning()?;
        self.run_commands().await;
        Ok(())
    }

    pub async fn continue_after_params(&mut self) -> Result<(), EngineError> {
        self.engine.continue_after_params()?;
        self.run_commands().await;
        Ok(())
    }

    pub async fn close(&mut self) {
        self.engine.close();
        self.run_commands().await;
    }

    fn on_connect_result(
        &mut self,
        session: SessionId,
        result: Result<Connection, ConnectionError>,
    ) -> Option<Input> {
        if self.engine.session() != Some(session) {
            debug!(session = %session, "dropping connection for an abandoned session");
            return None;
        }
        Some(match result {
            Ok(connection) => {
                info!(candidate = %connection.candidate, ssl = connection.ssl, "transport ready");
                self.transport = Some(connection.transport);
                Input::Connected {
                    session,
                    ssl: connection.ssl,
                }
            }
            Err(error) => Input::ConnectFailed { session, error },
        })
    }

    /// Carry out everything the engine has queued, including commands
    /// produced while doing so.
    async fn run_commands(&mut self) {
        while let Some(command) = self.engine.poll_command() {
            match command {
                Command::Connect { session, request } => {
                    let connector = Arc::clone(&self.connector);
                    self.transport = None;
                    self.keepalive = None;
                    let attempt = async move { connector.connect(&request).await }.boxed();
                    self.connecting = Some((session, attempt));
                }
                Command::CancelConnect { session } => {
                    if self.connecting.as_ref().is_some_and(|(s, _)| *s == session) {
                        debug!(session = %session, "abandoning connect attempt");
                        self.connecting = None;
                    }
                }
                Command::Write(bytes) => {
                    let Some(transport) = self.transport.as_mut() else {
                        debug!(len = bytes.len(), "no transport for write");
                        continue;
                    };
                    if let Err(error) = transport.send(&bytes).await {
                        warn!(error = %error, "transport write failed");
                        self.transport = None;
                        self.engine.handle(Input::TransportClosed);
                    }
                }
                Command::Close => {
                    if let Some(mut transport) = self.transport.take() {
                        if let Err(error) = transport.close().await {
                            debug!(error = %error, "error while closing transport");
                        }
                    }
                }
                Command::SetPollInterval(interval) => {
                    if let Some(transport) = self.transport.as_mut() {
                        transport.set_poll_interval(interval);
                    }
                }
                Command::StartKeepalive(period) => self.keepalive = Some(keepalive(period)),
                Command::StopKeepalive => self.keepalive = None,
            }
        }
    }
}

/// Longest keepalive period the timer accepts; longer ones are clamped.
const MAX_KEEPALIVE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn keepalive(period: Duration) -> Interval {
    let period = period.min(MAX_KEEPALIVE);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn wait_connect(
    pending: &mut Option<(SessionId, PendingConnect)>,
) -> (SessionId, Result<Connection, ConnectionError>) {
    match pending {
        Some((session, attempt)) => (*session, attempt.await),
        None => future::pending().await,
    }
}

async fn recv(transport: &mut Option<Transport>) -> Result<Vec<u8>, ConnectionError> {
    match transport {
        Some(transport) => transport.recv().await,
        None => future::pending().await,
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::proxy::MockDial;
    use crate::resolver::{MockSrvSource, ServiceResolver};

    const HEADER: &str = "<stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' id='c1' from='example.com' version='1.0'>";

    fn client_with_pipe(stream: StreamOptions) -> (Client<MockDial, MockSrvSource>, DuplexStream) {
        let (transport, server) = Transport::in_memory(64 * 1024);
        let slot = Arc::new(Mutex::new(Some(transport)));
        let mut dial = MockDial::new();
        dial.expect_dial().times(1).returning(move |_, _| {
            let transport = slot.lock().unwrap().take();
            Box::pin(async move {
                transport.ok_or_else(|| ConnectionError::ConnectionRefused("used".into()))
            })
        });
        let mut source = MockSrvSource::new();
        source.expect_lookup_srv().never();

        let options = ConnectOptions::default().with_host("127.0.0.1", 5222);
        let connector =
            Connector::with_parts(dial, ServiceResolver::new(source, LookupRegistry::init()));
        let engine = StreamEngine::new(options, stream, TlsSettings::default());
        (Client::with_connector(engine, connector), server)
    }

    async fn read_until(server: &mut DuplexStream, needle: &str) -> String {
        let mut seen = String::new();
        let mut buf = vec![0u8; 4096];
        while !seen.contains(needle) {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up while waiting for {needle}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        seen
    }

    #[tokio::test(flavor = "current_thread")]
    async fn drives_a_plaintext_session_to_active() {
        let (mut client, mut server) = client_with_pipe(StreamOptions {
            allow_plain: true,
            ..StreamOptions::default()
        });
        client.set_password("secret");

        let peer = tokio::spawn(async move {
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(
                    format!(
                        "{HEADER}<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                         <mechanism>PLAIN</mechanism></mechanisms></stream:features>"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            read_until(&mut server, "</auth>").await;
            server
                .write_all(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
                .await
                .unwrap();
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(format!("{HEADER}<stream:features/>").as_bytes())
                .await
                .unwrap();
            let seen = read_until(&mut server, "<presence").await;
            server
                .write_all(b"<message from='b@example.com'><body>hi</body></message>")
                .await
                .unwrap();
            read_until(&mut server, "</stream:stream>").await;
            seen
        });

        client.connect("user@example.com/res").await.unwrap();
        let mut signals = Vec::new();
        while let Some(event) = client.next_event().await {
            match event {
                ClientEvent::Signal(Signal::Warning(_)) => {
                    client.continue_after_warning().await.unwrap();
                }
                ClientEvent::Signal(Signal::Authenticated) => {
                    signals.push(Signal::Authenticated);
                    client.send_raw("<presence/>").await.unwrap();
                }
                ClientEvent::Signal(signal) => signals.push(signal),
                ClientEvent::Stanza(stanza) => {
                    assert_eq!(stanza.name(), "message");
                    client.close().await;
                }
                ClientEvent::Handshaken(_) => panic!("no TLS in this session"),
            }
        }

        assert_eq!(
            signals,
            vec![Signal::Connected, Signal::Authenticated, Signal::ConnectionClosed]
        );
        assert_eq!(client.state(), State::Closed);
        assert!(peer.await.unwrap().contains("<presence/>"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn peer_hangup_ends_the_event_stream() {
        let (mut client, server) = client_with_pipe(StreamOptions::default());
        client.connect("user@example.com").await.unwrap();
        assert_eq!(
            client.next_event().await,
            Some(ClientEvent::Signal(Signal::Connected))
        );

        drop(server);
        assert_eq!(
            client.next_event().await,
            Some(ClientEvent::Signal(Signal::ConnectionClosed))
        );
        assert_eq!(client.next_event().await, None);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn keepalive_writes_whitespace() {
        let (mut client, mut server) = client_with_pipe(StreamOptions {
            allow_plain: true,
            noop_interval_ms: 1_000,
            ..StreamOptions::default()
        });
        client.set_password("secret");
        client.connect("user@example.com").await.unwrap();

        let peer = tokio::spawn(async move {
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(
                    format!(
                        "{HEADER}<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                         <mechanism>PLAIN</mechanism></mechanisms></stream:features>"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            read_until(&mut server, "</auth>").await;
            server
                .write_all(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
                .await
                .unwrap();
            read_until(&mut server, "<stream:stream").await;
            server
                .write_all(format!("{HEADER}<stream:features/>").as_bytes())
                .await
                .unwrap();
            let mut space = [0u8; 1];
            server.read_exact(&mut space).await.unwrap();
            (space, server)
        });

        loop {
            match client.next_event().await {
                Some(ClientEvent::Signal(Signal::Warning(_))) => {
                    client.continue_after_warning().await.unwrap();
                }
                Some(ClientEvent::Signal(Signal::Authenticated)) => break,
                Some(_) => {}
                None => panic!("session ended early"),
            }
        }

        // The paused clock advances to the first tick once everything idles.
        let waiting = tokio::time::timeout(Duration::from_secs(5), client.next_event()).await;
        assert!(waiting.is_err());
        let (space, _server) = peer.await.unwrap();
        assert_eq!(&space, b" ");
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_keepalive_period_is_clamped() {
        let interval = keepalive(Duration::MAX);
        assert_eq!(interval.period(), MAX_KEEPALIVE);
    }
}
